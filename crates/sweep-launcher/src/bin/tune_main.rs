//! Hyperparameter Search - Main Entry Point
//!
//! Samples trial configurations from a parameter space and runs them as
//! trainer jobs, a fixed number at a time.
//!
//! # Usage
//!
//! ```bash
//! # Built-in pause-cost search, 100 trials, 4 concurrent runs
//! sweep-tune src/atari_cr/agents/dqn_atari_cr/main.py 1 --interpreter python \
//!     --pass-through=--use_pause_env --total-timesteps 1000000
//!
//! # Custom space, reproducible sampling
//! sweep-tune ./train.sh 2 --space space.yaml --num-samples 12 --rng-seed 7
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser};

use sweep_launcher::config::{init_logging, ExperimentArgs, LaunchArgs, LoggingConfig};
use sweep_launcher::{
    FileLogSink, GpuAssignment, ParamSpace, Program, SearchDriver, SearchSettings, SweepLauncher,
};

#[derive(Args, Debug, Clone)]
struct SearchArgs {
    /// Parameter space file (YAML or JSON); the built-in pause search when omitted
    #[arg(long, value_name = "FILE")]
    space: Option<PathBuf>,

    /// Number of trials to sample
    #[arg(long, default_value_t = 100)]
    num_samples: usize,

    /// Trials running at the same time
    #[arg(long, default_value_t = 4)]
    concurrent_runs: usize,

    /// Seed of the trial sampler
    #[arg(long, default_value_t = 0)]
    rng_seed: u64,

    /// Environment every trial trains on
    #[arg(long, default_value = "ms_pacman")]
    env: String,

    /// Trainer seed passed to every trial
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

impl SearchArgs {
    fn settings(&self) -> SearchSettings {
        SearchSettings {
            num_samples: self.num_samples,
            concurrent_runs: self.concurrent_runs,
            rng_seed: self.rng_seed,
            env: self.env.clone(),
            seed: self.seed,
        }
    }

    fn space(&self) -> Result<ParamSpace> {
        match &self.space {
            Some(path) => ParamSpace::from_file(path),
            None => Ok(ParamSpace::pause_search()),
        }
    }
}

/// Hyperparameter search driver
#[derive(Parser, Debug)]
#[command(name = "sweep-tune")]
#[command(author = "Atari-CR Team")]
#[command(version = "0.1.0")]
#[command(about = "Run sampled trainer configurations across GPUs")]
struct Cli {
    #[command(flatten)]
    launch: LaunchArgs,

    #[command(flatten)]
    search: SearchArgs,

    #[command(flatten)]
    experiment: ExperimentArgs,

    #[command(flatten)]
    logging: LoggingConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    init_logging(&cli.logging)?;

    if cli.experiment.config.is_none() && cli.experiment.exp_name.is_none() {
        cli.experiment.exp_name = Some("tuning".to_string());
    }

    if let Err(e) = run(cli).await {
        tracing::error!("{:#}", e);
        process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.experiment.resolve()?;
    let program = Program::resolve(&cli.launch.target, cli.launch.interpreter.as_deref())?;
    let assignment = GpuAssignment::resolve(cli.launch.gpu_count, cli.launch.gpu_ids.clone())?;
    let space = cli.search.space()?;
    let settings = cli.search.settings();

    tracing::info!(
        "Search '{}' on {}: {} trial(s), {} concurrent, GPUs {:?}",
        config.exp_name,
        settings.env,
        settings.num_samples,
        settings.concurrent_runs,
        assignment.devices()
    );

    let launcher = SweepLauncher::new(Arc::new(FileLogSink))
        .with_policy(cli.launch.failure_policy)
        .with_summary(false);
    let driver = SearchDriver::new(launcher, space, settings);
    let report = driver
        .run(&config, &program, &assignment, &cli.launch.extra)
        .await?;

    println!(
        "{} trial(s) recorded in {}",
        report.trials.len(),
        config.run_dir().join(sweep_launcher::search::TRIALS_FILE).display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_search_defaults() {
        let cli = Cli::try_parse_from(["sweep-tune", "train.sh"]).unwrap();
        assert_eq!(cli.search.settings(), SearchSettings::default());
        assert_eq!(cli.search.space().unwrap(), ParamSpace::pause_search());
    }

    #[test]
    fn test_cli_search_flags() {
        let cli = Cli::try_parse_from([
            "sweep-tune",
            "train.sh",
            "1",
            "--num-samples",
            "8",
            "--concurrent-runs",
            "2",
            "--rng-seed",
            "9",
        ])
        .unwrap();
        let settings = cli.search.settings();
        assert_eq!(settings.num_samples, 8);
        assert_eq!(settings.concurrent_runs, 2);
        assert_eq!(settings.rng_seed, 9);
        assert_eq!(cli.launch.gpu_count, Some(1));
    }
}
