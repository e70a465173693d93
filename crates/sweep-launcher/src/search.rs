//! Hyperparameter Search Module
//!
//! Samples trial configurations from a declared parameter space and runs each
//! trial as one trainer job. Trials are spread over a fixed number of
//! concurrent lanes.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ExperimentConfig;
use crate::device::GpuAssignment;
use crate::error::SweepError;
use crate::launcher::{JobOutcome, Lane, Program, SweepLauncher, SweepReport};
use crate::plan::PlanBuilder;

/// Written next to the trial logs after every search
pub const TRIALS_FILE: &str = "trials.json";

/// Sampling distribution of one parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Distribution {
    /// Uniform in `[low, high]`, rounded to a multiple of `q`
    QUniform { low: f64, high: f64, q: f64 },
    Uniform { low: f64, high: f64 },
    /// Integer in `[low, high)`
    RandInt { low: i64, high: i64 },
    Choice { values: Vec<ParamValue> },
}

impl Distribution {
    fn validate(&self, name: &str) -> Result<()> {
        let problem = match self {
            Self::QUniform { low, high, q } => {
                if !(low.is_finite() && high.is_finite() && q.is_finite()) {
                    Some("bounds must be finite".to_string())
                } else if low > high {
                    Some(format!("low {} is above high {}", low, high))
                } else if *q <= 0.0 {
                    Some(format!("q must be positive, got {}", q))
                } else {
                    None
                }
            }
            Self::Uniform { low, high } => {
                if !(low.is_finite() && high.is_finite()) {
                    Some("bounds must be finite".to_string())
                } else if low > high {
                    Some(format!("low {} is above high {}", low, high))
                } else {
                    None
                }
            }
            Self::RandInt { low, high } => {
                (low >= high).then(|| format!("empty range [{}, {})", low, high))
            }
            Self::Choice { values } => values
                .is_empty()
                .then(|| "choice needs at least one value".to_string()),
        };

        match problem {
            Some(problem) => Err(SweepError::InvalidConfig(format!(
                "parameter '{}': {}",
                name, problem
            ))
            .into()),
            None => Ok(()),
        }
    }

    fn sample<R: Rng>(&self, rng: &mut R) -> ParamValue {
        match self {
            Self::QUniform { low, high, q } => {
                let raw = rng.random_range(*low..=*high);
                let quantized = snap_to_step((raw / q).round() * q, *q);
                ParamValue::Float(quantized.clamp(*low, *high))
            }
            Self::Uniform { low, high } => ParamValue::Float(rng.random_range(*low..=*high)),
            Self::RandInt { low, high } => ParamValue::Int(rng.random_range(*low..*high)),
            Self::Choice { values } => values[rng.random_range(0..values.len())].clone(),
        }
    }
}

/// Round away float noise so `7 * 0.002` prints as `0.014`
fn snap_to_step(value: f64, q: f64) -> f64 {
    let step = q.to_string();
    let decimals = step
        .split_once('.')
        .map_or(0, |(_, fraction)| fraction.len())
        .min(15);
    let scale = 10f64.powi(decimals as i32);
    (value * scale).round() / scale
}

/// A sampled (or chosen) parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "{}", v),
        }
    }
}

/// One searchable parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(flatten)]
    pub dist: Distribution,

    /// Trainer flags receiving the value (`--<name>` when empty)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

impl ParamSpec {
    pub fn new(dist: Distribution) -> Self {
        Self {
            dist,
            flags: Vec::new(),
        }
    }

    pub fn with_flags(mut self, flags: &[&str]) -> Self {
        self.flags = flags.iter().map(|flag| flag.to_string()).collect();
        self
    }
}

/// Named parameters to search over, in name order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSpace {
    params: BTreeMap<String, ParamSpec>,
}

impl ParamSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause-cost search used for the pauseable DQN agent
    ///
    /// One sampled quantization feeds both sensory action axes.
    pub fn pause_search() -> Self {
        let mut space = Self::new();
        space.insert(
            "pause_cost",
            ParamSpec::new(Distribution::QUniform {
                low: 0.0,
                high: 0.03,
                q: 0.002,
            }),
        );
        space.insert(
            "pvm_stack",
            ParamSpec::new(Distribution::RandInt { low: 1, high: 20 }),
        );
        space.insert(
            "sensory_action_space_quantization",
            ParamSpec::new(Distribution::RandInt { low: 1, high: 84 })
                .with_flags(&["--sensory_action_x_size", "--sensory_action_y_size"]),
        );
        space.insert(
            "saccade_cost_scale",
            ParamSpec::new(Distribution::QUniform {
                low: 0.0,
                high: 0.005,
                q: 0.0005,
            }),
        );
        space
    }

    /// Load a parameter space from a YAML or JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read parameter space: {}", path.display()))?;

        let space: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML space: {}", path.display()))?,
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON space: {}", path.display()))?,
            _ => anyhow::bail!(
                "Unsupported parameter space format: {} (use .yaml, .yml or .json)",
                path.display()
            ),
        };
        space.validate()?;
        Ok(space)
    }

    pub fn insert(&mut self, name: impl Into<String>, spec: ParamSpec) {
        self.params.insert(name.into(), spec);
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.params.is_empty() {
            return Err(SweepError::InvalidConfig("parameter space is empty".to_string()).into());
        }
        for (name, spec) in &self.params {
            spec.dist.validate(name)?;
            if let Some(flag) = spec.flags.iter().find(|flag| !flag.starts_with('-')) {
                return Err(SweepError::InvalidConfig(format!(
                    "parameter '{}': flag '{}' must start with '-'",
                    name, flag
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Draw one value per parameter
    pub fn sample<R: Rng>(&self, rng: &mut R) -> BTreeMap<String, ParamValue> {
        self.params
            .iter()
            .map(|(name, spec)| (name.clone(), spec.dist.sample(rng)))
            .collect()
    }

    /// Flags a parameter is written to
    pub fn flags_for(&self, name: &str) -> Vec<String> {
        match self.params.get(name) {
            Some(spec) if !spec.flags.is_empty() => spec.flags.clone(),
            _ => vec![format!("--{}", name)],
        }
    }
}

/// One sampled configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub index: usize,
    pub values: BTreeMap<String, ParamValue>,
}

impl Trial {
    /// Trainer flags for the sampled values
    ///
    /// `true` emits the bare flag and `false` omits it.
    pub fn to_args(&self, space: &ParamSpace) -> Vec<String> {
        let mut args = Vec::new();
        for (name, value) in &self.values {
            for flag in space.flags_for(name) {
                match value {
                    ParamValue::Bool(true) => args.push(flag),
                    ParamValue::Bool(false) => {}
                    other => {
                        args.push(flag);
                        args.push(other.to_string());
                    }
                }
            }
        }
        args
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSettings {
    pub num_samples: usize,
    pub concurrent_runs: usize,
    pub rng_seed: u64,
    /// Environment every trial trains on
    pub env: String,
    /// Trainer seed passed to every trial
    pub seed: u64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            num_samples: 100,
            concurrent_runs: 4,
            rng_seed: 0,
            env: "ms_pacman".to_string(),
            seed: 0,
        }
    }
}

impl SearchSettings {
    pub fn validate(&self) -> Result<()> {
        if self.num_samples == 0 {
            return Err(SweepError::InvalidConfig("num_samples must be > 0".to_string()).into());
        }
        if self.concurrent_runs == 0 {
            return Err(
                SweepError::InvalidConfig("concurrent_runs must be > 0".to_string()).into(),
            );
        }
        if self.env.is_empty() || self.env.contains('/') {
            return Err(SweepError::InvalidConfig(format!(
                "search environment '{}' is not a valid name",
                self.env
            ))
            .into());
        }
        Ok(())
    }
}

/// Trial and how it ended, as stored in `trials.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRecord {
    #[serde(flatten)]
    pub trial: Trial,
    pub args: Vec<String>,
    pub outcome: Option<JobOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchReport {
    pub exp_name: String,
    pub rng_seed: u64,
    pub space: ParamSpace,
    pub trials: Vec<TrialRecord>,
}

impl SearchReport {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize trials")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write trials: {}", path.display()))
    }
}

/// Search Driver - runs sampled trials through a [`SweepLauncher`]
pub struct SearchDriver {
    launcher: SweepLauncher,
    space: ParamSpace,
    settings: SearchSettings,
}

impl SearchDriver {
    pub fn new(launcher: SweepLauncher, space: ParamSpace, settings: SearchSettings) -> Self {
        Self {
            launcher,
            space,
            settings,
        }
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    /// Sample every trial up front; same RNG seed, same trials
    pub fn plan_trials(&self) -> Result<Vec<Trial>> {
        self.space.validate()?;
        self.settings.validate()?;

        let mut rng = StdRng::seed_from_u64(self.settings.rng_seed);
        Ok((0..self.settings.num_samples)
            .map(|index| Trial {
                index,
                values: self.space.sample(&mut rng),
            })
            .collect())
    }

    /// Trial `t` runs in lane `t mod concurrent_runs` on GPU `assignment.gpu_for(t)`
    pub fn plan_lanes(
        &self,
        config: &ExperimentConfig,
        program: &Program,
        assignment: &GpuAssignment,
        extra: &[String],
        trials: &[Trial],
    ) -> Result<Vec<Lane>> {
        let builder = PlanBuilder::new(config, &program.target, extra)?;
        let lane_count = self.settings.concurrent_runs.min(trials.len());

        let mut lanes: Vec<Lane> = (0..lane_count)
            .map(|index| Lane {
                index,
                jobs: Vec::new(),
            })
            .collect();
        for trial in trials {
            let job = builder.trial(
                trial.index,
                &self.settings.env,
                self.settings.seed,
                assignment.gpu_for(trial.index),
                &trial.to_args(&self.space),
            );
            lanes[trial.index % lane_count].jobs.push(job);
        }
        Ok(lanes)
    }

    /// Run every trial and write `trials.json`
    pub async fn run(
        &self,
        config: &ExperimentConfig,
        program: &Program,
        assignment: &GpuAssignment,
        extra: &[String],
    ) -> Result<SearchReport> {
        config.validate()?;
        let trials = self.plan_trials()?;
        config.prepare_layout()?;

        let lanes = self.plan_lanes(config, program, assignment, extra, &trials)?;
        info!(
            "Running {} trial(s) over {} parameter(s), {} at a time, rng seed {}",
            trials.len(),
            self.space.len(),
            lanes.len(),
            self.settings.rng_seed
        );

        let sweep = self.launcher.run_lanes(&config.exp_name, program, lanes).await;
        sweep.log_summary();

        let report = self.build_report(config, trials, &sweep);
        let path = config.run_dir().join(TRIALS_FILE);
        report.write_json(&path)?;
        info!("Trials written to {}", path.display());

        self.launcher.check(&sweep)?;
        Ok(report)
    }

    fn build_report(
        &self,
        config: &ExperimentConfig,
        trials: Vec<Trial>,
        sweep: &SweepReport,
    ) -> SearchReport {
        let mut outcomes: BTreeMap<usize, JobOutcome> = sweep
            .outcomes
            .iter()
            .filter_map(|outcome| outcome.trial.map(|index| (index, outcome.clone())))
            .collect();

        SearchReport {
            exp_name: config.exp_name.clone(),
            rng_seed: self.settings.rng_seed,
            space: self.space.clone(),
            trials: trials
                .into_iter()
                .map(|trial| TrialRecord {
                    args: trial.to_args(&self.space),
                    outcome: outcomes.remove(&trial.index),
                    trial,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::MemoryLogSink;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn driver(settings: SearchSettings) -> SearchDriver {
        SearchDriver::new(
            SweepLauncher::new(Arc::new(MemoryLogSink::new())),
            ParamSpace::pause_search(),
            settings,
        )
    }

    #[test]
    fn test_sampling_is_deterministic() {
        let settings = SearchSettings {
            num_samples: 20,
            rng_seed: 42,
            ..Default::default()
        };
        let a = driver(settings.clone()).plan_trials().unwrap();
        let b = driver(settings).plan_trials().unwrap();
        assert_eq!(a, b);

        let c = driver(SearchSettings {
            num_samples: 20,
            rng_seed: 43,
            ..Default::default()
        })
        .plan_trials()
        .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_samples_stay_in_bounds() {
        let space = ParamSpace::pause_search();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let values = space.sample(&mut rng);
            match &values["pause_cost"] {
                ParamValue::Float(v) => {
                    assert!((0.0..=0.03).contains(v));
                    let steps = v / 0.002;
                    assert!((steps - steps.round()).abs() < 1e-9);
                }
                other => panic!("unexpected value {:?}", other),
            }
            match &values["pvm_stack"] {
                ParamValue::Int(v) => assert!((1..20).contains(v)),
                other => panic!("unexpected value {:?}", other),
            }
            match &values["sensory_action_space_quantization"] {
                ParamValue::Int(v) => assert!((1..84).contains(v)),
                other => panic!("unexpected value {:?}", other),
            }
        }
    }

    #[test]
    fn test_snap_to_step() {
        assert_eq!(snap_to_step(7.0 * 0.002, 0.002), 0.014);
        assert_eq!(snap_to_step(3.0 * 0.0005, 0.0005), 0.0015);
        assert_eq!(snap_to_step(4.0, 1.0), 4.0);
    }

    #[test]
    fn test_trial_args_fan_out_to_flags() {
        let space = ParamSpace::pause_search();
        let mut values = BTreeMap::new();
        values.insert("pause_cost".to_string(), ParamValue::Float(0.014));
        values.insert(
            "sensory_action_space_quantization".to_string(),
            ParamValue::Int(6),
        );
        let trial = Trial { index: 0, values };

        assert_eq!(
            trial.to_args(&space),
            vec![
                "--pause_cost",
                "0.014",
                "--sensory_action_x_size",
                "6",
                "--sensory_action_y_size",
                "6",
            ]
        );
    }

    #[test]
    fn test_bool_values_become_switches() {
        let mut space = ParamSpace::new();
        space.insert(
            "use_emma",
            ParamSpec::new(Distribution::Choice {
                values: vec![ParamValue::Bool(true), ParamValue::Bool(false)],
            }),
        );
        let on = Trial {
            index: 0,
            values: BTreeMap::from([("use_emma".to_string(), ParamValue::Bool(true))]),
        };
        let off = Trial {
            index: 1,
            values: BTreeMap::from([("use_emma".to_string(), ParamValue::Bool(false))]),
        };
        assert_eq!(on.to_args(&space), vec!["--use_emma"]);
        assert!(off.to_args(&space).is_empty());
    }

    #[test]
    fn test_space_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("space.yaml");
        std::fs::write(
            &path,
            "pause_cost:\n  type: quniform\n  low: 0\n  high: 0.03\n  q: 0.002\n\
             quantization:\n  type: randint\n  low: 1\n  high: 84\n  flags: [--sensory_action_x_size, --sensory_action_y_size]\n\
             optimizer:\n  type: choice\n  values: [adam, sgd]\n",
        )
        .unwrap();

        let space = ParamSpace::from_file(&path).unwrap();
        assert_eq!(space.len(), 3);
        assert_eq!(
            space.flags_for("quantization"),
            vec!["--sensory_action_x_size", "--sensory_action_y_size"]
        );
        assert_eq!(space.flags_for("optimizer"), vec!["--optimizer"]);
    }

    #[test]
    fn test_invalid_spaces_rejected() {
        let mut space = ParamSpace::new();
        assert!(space.validate().is_err());

        space.insert(
            "pvm_stack",
            ParamSpec::new(Distribution::RandInt { low: 5, high: 5 }),
        );
        let err = space.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SweepError>(),
            Some(SweepError::InvalidConfig(_))
        ));

        let mut space = ParamSpace::new();
        space.insert(
            "pause_cost",
            ParamSpec::new(Distribution::QUniform {
                low: 0.0,
                high: 1.0,
                q: 0.0,
            }),
        );
        assert!(space.validate().is_err());
    }

    #[test]
    fn test_trials_spread_over_lanes_and_gpus() {
        let driver = driver(SearchSettings {
            num_samples: 10,
            concurrent_runs: 4,
            ..Default::default()
        });
        let config = ExperimentConfig {
            exp_name: "tuning".to_string(),
            output_root: PathBuf::from("/out"),
            ..Default::default()
        };
        let program = Program::resolve(Path::new("/bin/sh"), None).unwrap();
        let trials = driver.plan_trials().unwrap();
        let lanes = driver
            .plan_lanes(
                &config,
                &program,
                &GpuAssignment::round_robin(3).unwrap(),
                &[],
                &trials,
            )
            .unwrap();

        assert_eq!(lanes.len(), 4);
        assert_eq!(lanes[0].jobs.len(), 3);
        assert_eq!(lanes[3].jobs.len(), 2);
        for lane in &lanes {
            for job in &lane.jobs {
                let index = job.trial.unwrap();
                assert_eq!(index % 4, lane.index);
                assert_eq!(job.gpu as usize, index % 3);
                assert_eq!(job.env, "ms_pacman");
            }
        }
        assert_eq!(
            lanes[1].jobs[1].log_path,
            config.logs_dir().join("trial_5__sh.txt")
        );
    }
}
