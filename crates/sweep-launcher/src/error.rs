use std::path::PathBuf;

use thiserror::Error;

/// Failures the launcher reports before or after running jobs.
///
/// Library functions return `anyhow::Result`; these variants travel inside it
/// and can be recovered with `downcast_ref::<SweepError>()`.
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Target program not found: {0}")]
    TargetNotFound(PathBuf),

    #[error("Target program is not an executable file: {0}")]
    TargetNotExecutable(PathBuf),

    #[error("No GPUs available (pass a GPU count explicitly or check nvidia-smi)")]
    NoGpus,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{failed} of {total} job(s) failed")]
    JobsFailed { failed: usize, total: usize },

    #[error("Sweep interrupted before all jobs finished")]
    Interrupted,

    #[error("Unknown launch profile: {0}")]
    UnknownProfile(String),
}
