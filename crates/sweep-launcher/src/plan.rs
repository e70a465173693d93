//! Job Plan Module
//!
//! Everything needed to start one training process: its GPU, argument
//! vector, environment variables and log file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::ExperimentConfig;

/// Environment variable restricting the trainer to one GPU
pub const GPU_ENV_VAR: &str = "CUDA_VISIBLE_DEVICES";

/// Startup plan for a single job
#[derive(Debug, Clone, PartialEq)]
pub struct JobPlan {
    /// Unique job identifier (`<env>/seed-<seed>` or `trial-<n>`)
    pub job_id: String,

    pub env: String,

    pub seed: u64,

    /// Search trial index, if this job belongs to a search
    pub trial: Option<usize>,

    /// GPU index exported through `CUDA_VISIBLE_DEVICES`
    pub gpu: u32,

    /// Full trainer argument list
    pub args: Vec<String>,

    /// Log file receiving stdout and stderr
    pub log_path: PathBuf,

    /// Extra environment variables
    pub env_vars: BTreeMap<String, String>,
}

impl JobPlan {
    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn build_command_args(&self) -> Vec<String> {
        self.args.clone()
    }

    /// Environment for the child process; the GPU restriction always wins
    pub fn build_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env_vars.clone();
        env.insert("SWEEP_JOB_ID".to_string(), self.job_id.clone());
        env.insert(GPU_ENV_VAR.to_string(), self.gpu.to_string());
        env
    }
}

/// `<environment>__<target basename>__<seed>.txt`
pub fn log_file_name(env: &str, target_name: &str, seed: u64) -> String {
    format!("{}__{}__{}.txt", env, target_name, seed)
}

/// `trial_<index>__<target basename>.txt`
pub fn trial_log_file_name(index: usize, target_name: &str) -> String {
    format!("trial_{}__{}.txt", index, target_name)
}

/// File name of the target program, extension included
pub fn target_basename(target: &Path) -> Result<String> {
    target
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .with_context(|| format!("Target path has no file name: {}", target.display()))
}

/// Builds job plans for one experiment and one target
#[derive(Debug, Clone)]
pub struct PlanBuilder<'a> {
    config: &'a ExperimentConfig,
    target_name: String,
    extra: &'a [String],
}

impl<'a> PlanBuilder<'a> {
    pub fn new(config: &'a ExperimentConfig, target: &Path, extra: &'a [String]) -> Result<Self> {
        Ok(Self {
            config,
            target_name: target_basename(target)?,
            extra,
        })
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Fixed trainer flags, experiment values and pass-through flags
    ///
    /// Caller extras are not included; they always go last.
    pub fn trainer_args(&self, env: &str, seed: u64) -> Vec<String> {
        let trainer = &self.config.trainer;
        let mut args = vec![
            "--env".to_string(),
            env.to_string(),
            "--env_num".to_string(),
            trainer.env_num.to_string(),
            "--seed".to_string(),
            seed.to_string(),
            "--exp_name".to_string(),
            self.config.exp_name.clone(),
            "--fov_size".to_string(),
            trainer.fov_size.to_string(),
        ];
        if trainer.clip_reward {
            args.push("--clip_reward".to_string());
        }
        if trainer.capture_video {
            args.push("--capture_video".to_string());
        }
        args.extend([
            "--total_timesteps".to_string(),
            trainer.total_timesteps.to_string(),
            "--buffer_size".to_string(),
            trainer.buffer_size.to_string(),
            "--learning_start".to_string(),
            trainer.learning_start.to_string(),
            "--frame_stack".to_string(),
            trainer.frame_stack.to_string(),
            "--pause_cost".to_string(),
            trainer.pause_cost.to_string(),
        ]);
        args.extend(self.config.pass_through.iter().cloned());
        args
    }

    /// Plan for one (environment, seed) pair
    pub fn job(&self, env: &str, seed: u64, gpu: u32) -> JobPlan {
        let mut args = self.trainer_args(env, seed);
        args.extend(self.extra.iter().cloned());

        JobPlan {
            job_id: format!("{}/seed-{}", env, seed),
            env: env.to_string(),
            seed,
            trial: None,
            gpu,
            args,
            log_path: self
                .config
                .logs_dir()
                .join(log_file_name(env, &self.target_name, seed)),
            env_vars: BTreeMap::new(),
        }
        .with_env("SWEEP_EXP_NAME", self.config.exp_name.clone())
    }

    /// Plan for one search trial
    ///
    /// Sampled flags come after the fixed flags so the trainer's
    /// last-occurrence-wins parsing lets them override.
    pub fn trial(
        &self,
        index: usize,
        env: &str,
        seed: u64,
        gpu: u32,
        sampled: &[String],
    ) -> JobPlan {
        let mut args = self.trainer_args(env, seed);
        args.extend(sampled.iter().cloned());
        args.extend(self.extra.iter().cloned());

        JobPlan {
            job_id: format!("trial-{}", index),
            env: env.to_string(),
            seed,
            trial: Some(index),
            gpu,
            args,
            log_path: self
                .config
                .logs_dir()
                .join(trial_log_file_name(index, &self.target_name)),
            env_vars: BTreeMap::new(),
        }
        .with_env("SWEEP_EXP_NAME", self.config.exp_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ExperimentConfig {
        ExperimentConfig {
            envs: vec!["boxing".to_string()],
            seeds: vec![0, 1],
            exp_name: "pause".to_string(),
            output_root: PathBuf::from("/out"),
            pass_through: vec!["--use_pause_env".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_log_file_name() {
        assert_eq!(log_file_name("boxing", "main.py", 0), "boxing__main.py__0.txt");
        assert_eq!(trial_log_file_name(12, "main.py"), "trial_12__main.py.txt");
    }

    #[test]
    fn test_job_plan_build_args() {
        let config = config();
        let extra = vec!["--debug".to_string(), "--action_repeat".to_string(), "5".to_string()];
        let builder = PlanBuilder::new(&config, Path::new("src/agents/main.py"), &extra).unwrap();
        let plan = builder.job("boxing", 1, 0);

        assert_eq!(
            plan.build_command_args(),
            vec![
                "--env",
                "boxing",
                "--env_num",
                "1",
                "--seed",
                "1",
                "--exp_name",
                "pause",
                "--fov_size",
                "20",
                "--clip_reward",
                "--capture_video",
                "--total_timesteps",
                "3000000",
                "--buffer_size",
                "100000",
                "--learning_start",
                "80000",
                "--frame_stack",
                "4",
                "--pause_cost",
                "0.1",
                "--use_pause_env",
                "--debug",
                "--action_repeat",
                "5",
            ]
        );
        assert_eq!(
            plan.log_path,
            PathBuf::from("/out/pause/logs/boxing__main.py__1.txt")
        );
        assert_eq!(plan.job_id, "boxing/seed-1");
    }

    #[test]
    fn test_job_plan_build_env() {
        let config = config();
        let builder = PlanBuilder::new(&config, Path::new("main.py"), &[]).unwrap();
        let plan = builder.job("boxing", 0, 3).with_env(GPU_ENV_VAR, "7");

        let env = plan.build_env();
        assert_eq!(env.get(GPU_ENV_VAR), Some(&"3".to_string()));
        assert_eq!(env.get("SWEEP_JOB_ID"), Some(&"boxing/seed-0".to_string()));
        assert_eq!(env.get("SWEEP_EXP_NAME"), Some(&"pause".to_string()));
    }

    #[test]
    fn test_log_path_is_pure() {
        let config = config();
        let a = PlanBuilder::new(&config, Path::new("/a/main.py"), &[]).unwrap();
        let b = PlanBuilder::new(&config, Path::new("/elsewhere/main.py"), &[]).unwrap();
        assert_eq!(a.job("boxing", 0, 0).log_path, b.job("boxing", 0, 1).log_path);
    }

    #[test]
    fn test_trial_plan_orders_sampled_before_extras() {
        let config = config();
        let extra = vec!["--debug".to_string()];
        let builder = PlanBuilder::new(&config, Path::new("main.py"), &extra).unwrap();
        let sampled = vec!["--pause_cost".to_string(), "0.014".to_string()];
        let plan = builder.trial(4, "ms_pacman", 0, 1, &sampled);

        let args = plan.build_command_args();
        let n = args.len();
        assert_eq!(&args[n - 3..], &["--pause_cost", "0.014", "--debug"]);
        assert_eq!(plan.trial, Some(4));
        assert_eq!(
            plan.log_path,
            PathBuf::from("/out/pause/logs/trial_4__main.py.txt")
        );
    }

    #[test]
    fn test_target_without_file_name() {
        assert!(target_basename(Path::new("/")).is_err());
    }
}
