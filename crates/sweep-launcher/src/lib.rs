//! Experiment sweep launcher
//!
//! Launches one training process per (environment, seed) pair, pins each
//! environment to a GPU by round-robin index and collects per-job logs.

pub mod config;
pub mod device;
pub mod error;
pub mod launcher;
pub mod logger;
pub mod plan;
pub mod process_manager;
pub mod profiles;
pub mod search;

pub use config::{ExperimentConfig, FailurePolicy, TrainerParams};
pub use device::{DeviceDiscovery, GpuAssignment, GpuDevice};
pub use error::SweepError;
pub use launcher::{JobOutcome, JobStatus, Lane, Program, SweepLauncher, SweepReport};
pub use logger::{FileLogSink, JobLog, LogSink, MemoryLogSink};
pub use plan::{JobPlan, PlanBuilder};
pub use process_manager::ProcessManager;
pub use profiles::{LaunchProfile, ProfileRegistry};
pub use search::{
    Distribution, ParamSpace, ParamSpec, ParamValue, SearchDriver, SearchSettings, Trial,
};
