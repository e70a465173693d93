//! Targets named relative to the working directory
//!
//! Kept in its own test binary: it changes the process working directory.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use sweep_launcher::{
    ExperimentConfig, FailurePolicy, FileLogSink, GpuAssignment, JobStatus, Program,
    SweepLauncher,
};

#[tokio::test]
async fn test_relative_target_in_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("train.sh");
    std::fs::write(&script, "#!/bin/sh\necho trained gpu=$CUDA_VISIBLE_DEVICES\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    std::env::set_current_dir(dir.path()).unwrap();

    let program = Program::resolve(Path::new("train.sh"), None).unwrap();
    assert!(program.exe.is_absolute());
    assert!(program.exe.ends_with("train.sh"));

    let config = ExperimentConfig {
        envs: vec!["boxing".to_string()],
        seeds: vec![0],
        exp_name: "relative".to_string(),
        output_root: dir.path().join("output"),
        ..Default::default()
    };
    let report = SweepLauncher::new(Arc::new(FileLogSink))
        .with_policy(FailurePolicy::Collect)
        .run(&config, &program, &GpuAssignment::round_robin(1).unwrap(), &[])
        .await
        .unwrap();

    assert_eq!(report.outcomes[0].status, JobStatus::Succeeded);
    let log = std::fs::read_to_string(&report.outcomes[0].log_path).unwrap();
    assert!(log.contains("trained gpu=0"));
}
