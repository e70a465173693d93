//! Sweep Launcher - Main Entry Point
//!
//! Launches one training process per (environment, seed) pair. Environments
//! run in parallel, each pinned to a GPU by round-robin index; seeds of one
//! environment run one after another.
//!
//! # Usage
//!
//! ```bash
//! # Default 26-game sweep over seeds 0,1,2 on 4 GPUs
//! sweep src/atari_cr/agents/dqn_atari_cr/main.py 4 --interpreter python
//!
//! # Two environments, one seed, extra flags forwarded to every job
//! sweep ./train.sh 2 --envs boxing,pong --seeds 0 --exp-name pause_sweep \
//!     -- --use_pause_env --action_repeat 5
//!
//! # Stop everything at the first failing job
//! sweep ./train.sh --gpu-ids 1,3 --failure-policy fail-fast
//! ```

use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use sweep_launcher::config::{init_logging, ExperimentArgs, LaunchArgs, LoggingConfig};
use sweep_launcher::{FileLogSink, GpuAssignment, Program, SweepLauncher};

/// Experiment sweep launcher
#[derive(Parser, Debug)]
#[command(name = "sweep")]
#[command(author = "Atari-CR Team")]
#[command(version = "0.1.0")]
#[command(about = "Run a training program over environments x seeds, one GPU per environment")]
struct Cli {
    #[command(flatten)]
    launch: LaunchArgs,

    #[command(flatten)]
    experiment: ExperimentArgs,

    #[command(flatten)]
    logging: LoggingConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.logging)?;

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

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                  Experiment Sweep v0.1.0                   ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    println!(
        "║  Target:      {:<44} ║",
        truncate_str(&program.target.display().to_string(), 44)
    );
    println!(
        "║  Experiment:  {:<44} ║",
        truncate_str(&config.exp_name, 44)
    );
    println!(
        "║  Jobs:        {:<44} ║",
        format!("{} envs x {} seeds", config.envs.len(), config.seeds.len())
    );
    println!(
        "║  GPUs:        {:<44} ║",
        truncate_str(&format!("{:?}", assignment.devices()), 44)
    );
    println!("╚════════════════════════════════════════════════════════════╝");
    config.log_summary();

    let launcher = SweepLauncher::new(Arc::new(FileLogSink)).with_policy(cli.launch.failure_policy);
    launcher
        .run(&config, &program, &assignment, &cli.launch.extra)
        .await?;

    println!("Logs written to {}", config.logs_dir().display());
    Ok(())
}

/// Truncate string to max length with ellipsis
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
