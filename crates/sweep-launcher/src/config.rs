//! Sweep Configuration Module
//!
//! Experiment parameters, command-line arguments and logging setup.
//!
//! # Layering
//!
//! ```text
//! ExperimentConfig (immutable once resolved)
//!   ├─ envs / seeds / exp_name / output_root
//!   ├─ TrainerParams (forwarded to every training process)
//!   └─ pass_through flags
//! ```
//!
//! A `--config` file (YAML or JSON) forms the base; options passed explicitly
//! on the command line override it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};

use crate::error::SweepError;

/// Atari games swept when no environment list is given.
pub const DEFAULT_ENVS: &[&str] = &[
    "alien",
    "amidar",
    "assault",
    "asterix",
    "bank_heist",
    "battle_zone",
    "boxing",
    "breakout",
    "chopper_command",
    "crazy_climber",
    "demon_attack",
    "freeway",
    "frostbite",
    "gopher",
    "hero",
    "jamesbond",
    "kangaroo",
    "krull",
    "kung_fu_master",
    "ms_pacman",
    "pong",
    "private_eye",
    "qbert",
    "road_runner",
    "seaquest",
    "up_n_down",
];

pub const DEFAULT_SEEDS: &[u64] = &[0, 1, 2];

/// Values forwarded to the training program as fixed flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerParams {
    /// Number of environments the trainer runs in parallel
    pub env_num: u32,
    /// Side length of the fovea in pixels
    pub fov_size: u32,
    pub clip_reward: bool,
    pub capture_video: bool,
    pub total_timesteps: u64,
    /// Replay buffer capacity
    pub buffer_size: u64,
    /// Timesteps collected before learning starts
    pub learning_start: u64,
    pub frame_stack: u32,
    /// Reward cost of a pause step
    pub pause_cost: f64,
}

impl Default for TrainerParams {
    fn default() -> Self {
        Self {
            env_num: 1,
            fov_size: 20,
            clip_reward: true,
            capture_video: true,
            total_timesteps: 3_000_000,
            buffer_size: 100_000,
            learning_start: 80_000,
            frame_stack: 4,
            pause_cost: 0.1,
        }
    }
}

/// Experiment configuration
///
/// Fixed at launch time and never mutated during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Environment identifiers, one lane each
    pub envs: Vec<String>,

    /// Seeds run sequentially inside every lane
    pub seeds: Vec<u64>,

    /// Experiment name (names the output subtree)
    pub exp_name: String,

    /// Root of the output tree
    pub output_root: PathBuf,

    /// Trainer values shared by every job
    pub trainer: TrainerParams,

    /// Extra fixed flags appended after the trainer values
    pub pass_through: Vec<String>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            envs: DEFAULT_ENVS.iter().map(|s| s.to_string()).collect(),
            seeds: DEFAULT_SEEDS.to_vec(),
            exp_name: "sweep".to_string(),
            output_root: PathBuf::from("output/runs"),
            trainer: TrainerParams::default(),
            pass_through: Vec::new(),
        }
    }
}

impl ExperimentConfig {
    /// Load from a configuration file (YAML or JSON)
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&content).context("Failed to parse YAML config")
            }
            Some("json") => serde_json::from_str(&content).context("Failed to parse JSON config"),
            _ => anyhow::bail!("Unsupported config file format (use .yaml, .yml, or .json)"),
        }
    }

    /// Check the invariants every sweep relies on
    ///
    /// Environment names and the experiment name become path components, and
    /// duplicates would make two jobs share one log file.
    pub fn validate(&self) -> Result<()> {
        if self.envs.is_empty() {
            return Err(invalid("environment list is empty"));
        }
        if self.seeds.is_empty() {
            return Err(invalid("seed list is empty"));
        }

        let mut seen = HashSet::new();
        for env in &self.envs {
            check_path_component("environment", env)?;
            if !seen.insert(env.as_str()) {
                return Err(invalid(&format!("duplicate environment: {}", env)));
            }
        }

        let mut seen = HashSet::new();
        for seed in &self.seeds {
            if !seen.insert(*seed) {
                return Err(invalid(&format!("duplicate seed: {}", seed)));
            }
        }

        check_path_component("exp_name", &self.exp_name)?;

        if self.trainer.env_num == 0 {
            return Err(invalid("env_num must be greater than 0"));
        }
        if self.trainer.frame_stack == 0 {
            return Err(invalid("frame_stack must be greater than 0"));
        }
        if !self.trainer.pause_cost.is_finite() || self.trainer.pause_cost < 0.0 {
            return Err(invalid("pause_cost must be a non-negative number"));
        }

        Ok(())
    }

    /// `<output_root>/<exp_name>`
    pub fn run_dir(&self) -> PathBuf {
        self.output_root.join(&self.exp_name)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.run_dir().join("logs")
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.run_dir().join("recordings")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.run_dir().join("trained_models")
    }

    /// Create the output tree (logs, recordings, trained models)
    pub fn prepare_layout(&self) -> Result<()> {
        for dir in [self.logs_dir(), self.recordings_dir(), self.models_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Log a configuration summary
    pub fn log_summary(&self) {
        tracing::info!("Experiment '{}' -> {}", self.exp_name, self.run_dir().display());
        tracing::info!("  Environments ({}): {}", self.envs.len(), self.envs.join(", "));
        tracing::info!(
            "  Seeds ({}): {:?}",
            self.seeds.len(),
            self.seeds
        );
        tracing::info!(
            "  Timesteps: {}, buffer: {}, learning start: {}",
            self.trainer.total_timesteps,
            self.trainer.buffer_size,
            self.trainer.learning_start
        );
        if !self.pass_through.is_empty() {
            tracing::info!("  Pass-through flags: {}", self.pass_through.join(" "));
        }
    }
}

fn invalid(message: &str) -> anyhow::Error {
    SweepError::InvalidConfig(message.to_string()).into()
}

fn check_path_component(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(invalid(&format!("{} must not be empty", what)));
    }
    if value.contains('/') || value.contains('\\') || value == "." || value == ".." {
        return Err(invalid(&format!(
            "{} '{}' cannot be used as a file name",
            what, value
        )));
    }
    Ok(())
}

/// What the launcher does when a job exits unsuccessfully
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Record the failure and keep going; the sweep still succeeds
    #[default]
    Ignore,
    /// Run everything, then report failure if any job failed
    Collect,
    /// Stop at the first failure: kill running jobs, skip pending ones
    FailFast,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ignore => write!(f, "ignore"),
            Self::Collect => write!(f, "collect"),
            Self::FailFast => write!(f, "fail-fast"),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "collect" => Ok(Self::Collect),
            "fail-fast" | "fail_fast" | "failfast" => Ok(Self::FailFast),
            _ => Err(format!("Unknown failure policy: {}", s)),
        }
    }
}

/// Experiment options shared by the sweep and tuning binaries
///
/// Every field is optional so that unset options fall back to the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct ExperimentArgs {
    /// Load the experiment from a YAML or JSON file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Environments to sweep (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub envs: Option<Vec<String>>,

    /// Seeds to run per environment (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub seeds: Option<Vec<u64>>,

    /// Experiment name
    #[arg(long)]
    pub exp_name: Option<String>,

    /// Output root directory
    #[arg(long)]
    pub output_root: Option<PathBuf>,

    #[arg(long)]
    pub total_timesteps: Option<u64>,

    #[arg(long)]
    pub buffer_size: Option<u64>,

    #[arg(long)]
    pub learning_start: Option<u64>,

    #[arg(long)]
    pub pause_cost: Option<f64>,

    #[arg(long)]
    pub fov_size: Option<u32>,

    #[arg(long)]
    pub frame_stack: Option<u32>,

    /// Extra fixed trainer flag, repeatable (e.g. --pass-through=--use_pause_env)
    #[arg(long = "pass-through", value_name = "FLAG", allow_hyphen_values = true)]
    pub pass_through: Vec<String>,
}

impl ExperimentArgs {
    /// Merge the file (if any) with explicit options and validate the result
    pub fn resolve(&self) -> Result<ExperimentConfig> {
        let mut config = match &self.config {
            Some(path) => ExperimentConfig::from_file(path)?,
            None => ExperimentConfig::default(),
        };

        if let Some(envs) = &self.envs {
            config.envs = envs.clone();
        }
        if let Some(seeds) = &self.seeds {
            config.seeds = seeds.clone();
        }
        if let Some(exp_name) = &self.exp_name {
            config.exp_name = exp_name.clone();
        }
        if let Some(output_root) = &self.output_root {
            config.output_root = output_root.clone();
        }
        if let Some(v) = self.total_timesteps {
            config.trainer.total_timesteps = v;
        }
        if let Some(v) = self.buffer_size {
            config.trainer.buffer_size = v;
        }
        if let Some(v) = self.learning_start {
            config.trainer.learning_start = v;
        }
        if let Some(v) = self.pause_cost {
            config.trainer.pause_cost = v;
        }
        if let Some(v) = self.fov_size {
            config.trainer.fov_size = v;
        }
        if let Some(v) = self.frame_stack {
            config.trainer.frame_stack = v;
        }
        config.pass_through.extend(self.pass_through.iter().cloned());

        config.validate()?;
        Ok(config)
    }
}

/// Target program, GPU placement and forwarded arguments
#[derive(Args, Debug, Clone)]
pub struct LaunchArgs {
    /// Training program to launch for every job
    pub target: PathBuf,

    /// Number of GPUs to spread environments over (nvidia-smi count when omitted)
    pub gpu_count: Option<usize>,

    /// Explicit GPU ids to cycle through instead of 0..gpu_count
    #[arg(long, value_delimiter = ',')]
    pub gpu_ids: Option<Vec<u32>>,

    /// Run the target through an interpreter (e.g. `python`)
    #[arg(long, value_name = "PROGRAM")]
    pub interpreter: Option<PathBuf>,

    /// Failure policy: ignore, collect, fail-fast
    #[arg(long, default_value = "ignore")]
    pub failure_policy: FailurePolicy,

    /// Arguments forwarded verbatim to every job (after `--`)
    #[arg(last = true)]
    pub extra: Vec<String>,
}

/// Logging options
#[derive(Args, Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, default_value = "text")]
    pub log_format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log_level: {} (must be trace/debug/info/warn/error)",
                self.log_level
            ),
        }
        match self.log_format.as_str() {
            "text" | "json" => Ok(()),
            _ => anyhow::bail!("Invalid log_format: {} (must be text/json)", self.log_format),
        }
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `--log-level` when set.
pub fn init_logging(logging: &LoggingConfig) -> Result<()> {
    logging.validate()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let result = if logging.log_format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ExperimentConfig {
        ExperimentConfig {
            envs: vec!["boxing".to_string(), "pong".to_string()],
            seeds: vec![0, 1],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ExperimentConfig::default();
        assert_eq!(config.envs.len(), 26);
        assert_eq!(config.seeds, vec![0, 1, 2]);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_lists_rejected() {
        let mut config = small_config();
        config.envs.clear();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SweepError>(),
            Some(SweepError::InvalidConfig(_))
        ));

        let mut config = small_config();
        config.seeds.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicates_and_bad_names_rejected() {
        let mut config = small_config();
        config.envs.push("boxing".to_string());
        assert!(config.validate().is_err());

        let mut config = small_config();
        config.seeds = vec![3, 3];
        assert!(config.validate().is_err());

        let mut config = small_config();
        config.exp_name = "../escape".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_layout_paths() {
        let config = ExperimentConfig {
            exp_name: "pause_sweep".to_string(),
            output_root: PathBuf::from("/data/out"),
            ..small_config()
        };
        assert_eq!(config.logs_dir(), PathBuf::from("/data/out/pause_sweep/logs"));
        assert_eq!(
            config.recordings_dir(),
            PathBuf::from("/data/out/pause_sweep/recordings")
        );
        assert_eq!(
            config.models_dir(),
            PathBuf::from("/data/out/pause_sweep/trained_models")
        );
    }

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!("ignore".parse::<FailurePolicy>().unwrap(), FailurePolicy::Ignore);
        assert_eq!("collect".parse::<FailurePolicy>().unwrap(), FailurePolicy::Collect);
        assert_eq!("fail-fast".parse::<FailurePolicy>().unwrap(), FailurePolicy::FailFast);
        assert!("retry".parse::<FailurePolicy>().is_err());
        assert_eq!(FailurePolicy::FailFast.to_string(), "fail-fast");
    }

    #[test]
    fn test_yaml_file_with_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.yaml");
        std::fs::write(
            &path,
            "envs: [boxing, freeway]\n\
             seeds: [7]\n\
             exp_name: from_file\n\
             trainer:\n  total_timesteps: 500000\n  pause_cost: 0.05\n\
             pass_through: [\"--use_pause_env\"]\n",
        )
        .unwrap();

        let args = ExperimentArgs {
            config: Some(path),
            seeds: Some(vec![0, 1]),
            pass_through: vec!["--debug".to_string()],
            ..Default::default()
        };
        let config = args.resolve().unwrap();

        assert_eq!(config.envs, vec!["boxing", "freeway"]);
        assert_eq!(config.seeds, vec![0, 1]);
        assert_eq!(config.exp_name, "from_file");
        assert_eq!(config.trainer.total_timesteps, 500_000);
        assert_eq!(config.trainer.pause_cost, 0.05);
        // untouched fields keep their defaults
        assert_eq!(config.trainer.buffer_size, 100_000);
        assert_eq!(config.pass_through, vec!["--use_pause_env", "--debug"]);
    }

    #[test]
    fn test_unsupported_config_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.toml");
        std::fs::write(&path, "envs = []").unwrap();
        assert!(ExperimentConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_logging_validation() {
        assert!(LoggingConfig::default().validate().is_ok());
        let bad = LoggingConfig {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
