//! Sweep Launcher Module
//!
//! Runs lanes of jobs: jobs inside a lane run one after another, lanes run in
//! parallel. A plain sweep has one lane per environment, holding one job per
//! seed.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{ExperimentConfig, FailurePolicy};
use crate::device::GpuAssignment;
use crate::error::SweepError;
use crate::logger::{JobLog, LogSink};
use crate::plan::{JobPlan, PlanBuilder};
use crate::process_manager::ProcessManager;

/// Summary written next to the logs after every sweep
pub const SUMMARY_FILE: &str = "sweep_summary.json";

/// Final state of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    /// Non-zero exit; `code` is None when killed by a signal
    Failed { code: Option<i32> },
    SpawnFailed { reason: String },
    /// Killed after the sweep was cancelled
    Cancelled,
    /// Never started because the sweep was cancelled first
    Skipped,
}

impl JobStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::SpawnFailed { .. })
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { code: Some(code) } => write!(f, "failed (exit code {})", code),
            Self::Failed { code: None } => write!(f, "failed (terminated by signal)"),
            Self::SpawnFailed { reason } => write!(f, "spawn failed: {}", reason),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Record of one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub env: String,
    pub seed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial: Option<usize>,
    pub gpu: u32,
    pub log_path: PathBuf,
    #[serde(flatten)]
    pub status: JobStatus,
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
}

impl JobOutcome {
    fn new(plan: &JobPlan, status: JobStatus) -> Self {
        Self {
            job_id: plan.job_id.clone(),
            env: plan.env.clone(),
            seed: plan.seed,
            trial: plan.trial,
            gpu: plan.gpu,
            log_path: plan.log_path.clone(),
            status,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Outcomes of every job of a sweep, in plan order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub exp_name: String,
    pub policy: FailurePolicy,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    /// Stopped by a shutdown signal rather than by the failure policy
    #[serde(default)]
    pub interrupted: bool,
    pub outcomes: Vec<JobOutcome>,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, JobStatus::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(JobStatus::is_failure)
    }

    pub fn cancelled(&self) -> usize {
        self.count(|s| matches!(s, JobStatus::Cancelled | JobStatus::Skipped))
    }

    fn count(&self, predicate: impl Fn(&JobStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.status)).count()
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize sweep report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write sweep report: {}", path.display()))
    }

    pub fn log_summary(&self) {
        info!(
            "Sweep '{}' finished: {} succeeded, {} failed, {} cancelled/skipped, {} total",
            self.exp_name,
            self.succeeded(),
            self.failed(),
            self.cancelled(),
            self.total()
        );
        if self.interrupted {
            warn!("Sweep '{}' was interrupted", self.exp_name);
        }
        for outcome in self.outcomes.iter().filter(|o| o.status.is_failure()) {
            warn!(
                "  {} {} (log: {})",
                outcome.job_id,
                outcome.status,
                outcome.log_path.display()
            );
        }
    }
}

/// Jobs executed one after another by a single task
#[derive(Debug, Clone)]
pub struct Lane {
    pub index: usize,
    pub jobs: Vec<JobPlan>,
}

/// What actually gets executed for every job
///
/// Either the target itself, or an interpreter with the target as its first
/// argument (`python main.py ...`).
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub exe: PathBuf,
    pub target: PathBuf,
    prefix_args: Vec<String>,
}

impl Program {
    /// Check the target (and interpreter) before anything is launched
    pub fn resolve(target: &Path, interpreter: Option<&Path>) -> Result<Self> {
        match interpreter {
            None => {
                let exe = resolve_executable(target)?;
                Ok(Self {
                    exe: exe.clone(),
                    target: exe,
                    prefix_args: Vec::new(),
                })
            }
            Some(interpreter) => {
                if !target.is_file() {
                    return Err(SweepError::TargetNotFound(target.to_path_buf()).into());
                }
                Ok(Self {
                    exe: resolve_executable(interpreter)?,
                    target: target.to_path_buf(),
                    prefix_args: vec![target.to_string_lossy().into_owned()],
                })
            }
        }
    }

    pub fn command_args(&self, plan: &JobPlan) -> Vec<String> {
        let mut args = self.prefix_args.clone();
        args.extend(plan.build_command_args());
        args
    }
}

/// Resolve a program to an absolute path, searching `PATH` for bare names
///
/// An existing relative path is anchored at the current directory, since the
/// child would otherwise look it up on `PATH`.
pub fn resolve_executable(program: &Path) -> Result<PathBuf> {
    let is_bare = program
        .parent()
        .map_or(true, |parent| parent.as_os_str().is_empty());

    let resolved = if program.exists() {
        std::path::absolute(program)
            .with_context(|| format!("Failed to resolve path: {}", program.display()))?
    } else if is_bare {
        find_in_path(program).ok_or_else(|| SweepError::TargetNotFound(program.to_path_buf()))?
    } else {
        return Err(SweepError::TargetNotFound(program.to_path_buf()).into());
    };

    if !resolved.is_file() || !is_executable(&resolved) {
        return Err(SweepError::TargetNotExecutable(resolved).into());
    }
    Ok(resolved)
}

fn find_in_path(program: &Path) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file() && is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Sweep Launcher - runs every job of an experiment and waits for all of them
#[derive(Clone)]
pub struct SweepLauncher {
    sink: Arc<dyn LogSink>,
    policy: FailurePolicy,
    write_summary: bool,
}

impl SweepLauncher {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            policy: FailurePolicy::default(),
            write_summary: true,
        }
    }

    /// Set failure policy
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Enable/disable writing `sweep_summary.json`
    pub fn with_summary(mut self, write_summary: bool) -> Self {
        self.write_summary = write_summary;
        self
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// One lane per environment, one job per seed
    ///
    /// The environment at position `i` runs on `assignment.gpu_for(i)`.
    pub fn plan_lanes(
        config: &ExperimentConfig,
        program: &Program,
        assignment: &GpuAssignment,
        extra: &[String],
    ) -> Result<Vec<Lane>> {
        let builder = PlanBuilder::new(config, &program.target, extra)?;

        Ok(config
            .envs
            .iter()
            .enumerate()
            .map(|(index, env)| {
                let gpu = assignment.gpu_for(index);
                Lane {
                    index,
                    jobs: config
                        .seeds
                        .iter()
                        .map(|seed| builder.job(env, *seed, gpu))
                        .collect(),
                }
            })
            .collect())
    }

    /// Run the full sweep
    ///
    /// Launch-time problems (bad config, missing target) fail before any job
    /// starts. Job failures are handled according to the failure policy.
    pub async fn run(
        &self,
        config: &ExperimentConfig,
        program: &Program,
        assignment: &GpuAssignment,
        extra: &[String],
    ) -> Result<SweepReport> {
        config.validate()?;
        config.prepare_layout()?;

        let lanes = Self::plan_lanes(config, program, assignment, extra)?;
        info!(
            "Launching {} job(s) in {} lane(s) over {} GPU(s) with policy '{}'",
            lanes.iter().map(|lane| lane.jobs.len()).sum::<usize>(),
            lanes.len(),
            assignment.len(),
            self.policy
        );

        let report = self.run_lanes(&config.exp_name, program, lanes).await;
        report.log_summary();
        if self.write_summary {
            report.write_json(&config.run_dir().join(SUMMARY_FILE))?;
        }
        self.check(&report)?;
        Ok(report)
    }

    /// Apply the failure policy to a finished sweep
    ///
    /// An interrupted sweep is an error under every policy.
    pub fn check(&self, report: &SweepReport) -> Result<()> {
        if report.interrupted {
            return Err(SweepError::Interrupted.into());
        }
        let failed = report.failed();
        if failed == 0 || self.policy == FailurePolicy::Ignore {
            return Ok(());
        }
        Err(SweepError::JobsFailed {
            failed,
            total: report.total(),
        }
        .into())
    }

    /// Run all lanes concurrently and wait for every one of them
    ///
    /// Ctrl-C stops the sweep: running jobs are killed and the report is
    /// marked interrupted.
    pub async fn run_lanes(
        &self,
        exp_name: &str,
        program: &Program,
        lanes: Vec<Lane>,
    ) -> SweepReport {
        let ctrl_c = async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        self.run_lanes_until(exp_name, program, lanes, ctrl_c).await
    }

    /// Like [`run_lanes`](Self::run_lanes), stopping when `shutdown` resolves
    pub async fn run_lanes_until<F>(
        &self,
        exp_name: &str,
        program: &Program,
        lanes: Vec<Lane>,
        shutdown: F,
    ) -> SweepReport
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let started_at = Local::now();
        let program = Arc::new(program.clone());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        let interrupted = Arc::new(AtomicBool::new(false));

        let interrupt = {
            let cancel_tx = Arc::clone(&cancel_tx);
            let interrupted = Arc::clone(&interrupted);
            tokio::spawn(async move {
                shutdown.await;
                warn!("Received shutdown signal, stopping all jobs");
                interrupted.store(true, Ordering::SeqCst);
                cancel_tx.send_replace(true);
            })
        };

        let mut lane_tasks = JoinSet::new();
        for lane in lanes {
            lane_tasks.spawn(run_lane(
                lane,
                Arc::clone(&program),
                Arc::clone(&self.sink),
                self.policy,
                Arc::clone(&cancel_tx),
                cancel_rx.clone(),
            ));
        }

        let mut per_lane = Vec::new();
        while let Some(joined) = lane_tasks.join_next().await {
            match joined {
                Ok(result) => per_lane.push(result),
                Err(e) => error!("Lane task failed: {}", e),
            }
        }
        interrupt.abort();

        per_lane.sort_by_key(|(index, _)| *index);
        SweepReport {
            exp_name: exp_name.to_string(),
            policy: self.policy,
            started_at,
            finished_at: Local::now(),
            interrupted: interrupted.load(Ordering::SeqCst),
            outcomes: per_lane.into_iter().flat_map(|(_, outcomes)| outcomes).collect(),
        }
    }
}

async fn run_lane(
    lane: Lane,
    program: Arc<Program>,
    sink: Arc<dyn LogSink>,
    policy: FailurePolicy,
    cancel_tx: Arc<watch::Sender<bool>>,
    mut cancel_rx: watch::Receiver<bool>,
) -> (usize, Vec<JobOutcome>) {
    let mut outcomes = Vec::with_capacity(lane.jobs.len());

    for plan in &lane.jobs {
        let cancelled = *cancel_rx.borrow();
        if cancelled {
            outcomes.push(JobOutcome::new(plan, JobStatus::Skipped));
            continue;
        }

        let outcome = run_job(&program, plan, sink.as_ref(), &mut cancel_rx).await;
        if outcome.status.is_failure() {
            warn!("Job {} on GPU {} {}", plan.job_id, plan.gpu, outcome.status);
            if policy == FailurePolicy::FailFast {
                cancel_tx.send_replace(true);
            }
        }
        outcomes.push(outcome);
    }

    (lane.index, outcomes)
}

enum Exit {
    Finished(Result<std::process::ExitStatus>),
    Cancelled,
}

async fn run_job(
    program: &Program,
    plan: &JobPlan,
    sink: &dyn LogSink,
    cancel: &mut watch::Receiver<bool>,
) -> JobOutcome {
    let mut outcome = JobOutcome::new(plan, JobStatus::Skipped);
    outcome.started_at = Some(Local::now());

    let log = match sink.open(&plan.log_path) {
        Ok(log) => log,
        Err(e) => {
            outcome.status = JobStatus::SpawnFailed {
                reason: format!("{:#}", e),
            };
            outcome.finished_at = Some(Local::now());
            return outcome;
        }
    };

    let args = program.command_args(plan);
    let command = format!("{} {}", program.exe.display(), args.join(" "));
    write_header(
        &log,
        plan,
        "INFO",
        &format!("Starting {} on GPU {}: {}", plan.job_id, plan.gpu, command),
    );
    info!("Starting {} on GPU {}", plan.job_id, plan.gpu);

    let mut process = match ProcessManager::spawn(
        &plan.job_id,
        &program.exe,
        &args,
        &plan.build_env(),
        log.clone(),
    ) {
        Ok(process) => process,
        Err(e) => {
            outcome.status = JobStatus::SpawnFailed {
                reason: format!("{:#}", e),
            };
            outcome.finished_at = Some(Local::now());
            write_header(&log, plan, "ERROR", &outcome.status.to_string());
            return outcome;
        }
    };

    let exit = tokio::select! {
        status = process.wait() => Exit::Finished(status),
        _ = cancellation(cancel) => Exit::Cancelled,
    };

    outcome.status = match exit {
        Exit::Finished(Ok(status)) if status.success() => JobStatus::Succeeded,
        Exit::Finished(Ok(status)) => JobStatus::Failed {
            code: status.code(),
        },
        Exit::Finished(Err(e)) => JobStatus::SpawnFailed {
            reason: format!("{:#}", e),
        },
        Exit::Cancelled => {
            if let Err(e) = process.kill().await {
                warn!("{:#}", e);
            }
            JobStatus::Cancelled
        }
    };
    outcome.finished_at = Some(Local::now());

    let level = if outcome.status.is_failure() { "ERROR" } else { "INFO" };
    write_header(
        &log,
        plan,
        level,
        &format!("Finished {}: {}", plan.job_id, outcome.status),
    );
    info!("Finished {}: {}", plan.job_id, outcome.status);

    outcome
}

fn write_header(log: &JobLog, plan: &JobPlan, level: &str, message: &str) {
    if let Err(e) = log.header(level, plan.gpu, message) {
        warn!("Failed to write log header for {}: {}", plan.job_id, e);
    }
}

/// Resolves once the sweep is cancelled; never resolves if it cannot be
async fn cancellation(cancel: &mut watch::Receiver<bool>) {
    let closed = cancel.wait_for(|cancelled| *cancelled).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}
