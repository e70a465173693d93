//! Process Manager Module
//!
//! Handles the lifecycle of one training process.
//!
//! On unix every job leads its own process group, so killing a job also
//! takes down whatever it started in the background.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::logger::JobLog;

/// How long output forwarders may keep reading once the process is gone
///
/// A background process left behind by the job can hold the pipes open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Manages a single child process whose output is appended to a [`JobLog`]
pub struct ProcessManager {
    job_id: String,
    child: Child,
    /// stdout forwarder
    stdout_task: Option<JoinHandle<()>>,
    /// stderr forwarder
    stderr_task: Option<JoinHandle<()>>,
}

impl ProcessManager {
    /// Spawn `exe_path` with stdout and stderr both forwarded to `log`
    pub fn spawn(
        job_id: &str,
        exe_path: &Path,
        args: &[String],
        env: &BTreeMap<String, String>,
        log: JobLog,
    ) -> Result<Self> {
        Self::spawn_in(job_id, exe_path, args, env, None, log)
    }

    /// Like [`ProcessManager::spawn`], optionally inside `cwd`
    pub fn spawn_in(
        job_id: &str,
        exe_path: &Path,
        args: &[String],
        env: &BTreeMap<String, String>,
        cwd: Option<&Path>,
        log: JobLog,
    ) -> Result<Self> {
        let mut command = Command::new(exe_path);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn job {}: {:?}", job_id, exe_path))?;

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| forward_output(job_id.to_string(), stdout, log.clone()));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| forward_output(job_id.to_string(), stderr, log));

        Ok(Self {
            job_id: job_id.to_string(),
            child,
            stdout_task,
            stderr_task,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Get the process ID (None once the process has been reaped)
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the process to exit and its output to be written
    ///
    /// Output still arriving [`DRAIN_GRACE`] after the exit is dropped.
    /// Cancel-safe: dropping the future leaves the process running.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self
            .child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for job {}", self.job_id))?;
        self.drain().await;
        Ok(status)
    }

    /// Kill the process and its process group, then reap it
    pub async fn kill(&mut self) -> Result<()> {
        self.kill_group();
        self.child
            .kill()
            .await
            .with_context(|| format!("Failed to kill job {}", self.job_id))?;
        self.drain().await;
        Ok(())
    }

    fn kill_group(&self) {
        #[cfg(unix)]
        {
            let Some(pid) = self.child.id() else {
                return;
            };
            // the child leads its group, so the group id is its pid
            let rc = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
            if rc != 0 {
                tracing::debug!(
                    "Failed to signal process group of {}: {}",
                    self.job_id,
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    /// Wait for the output forwarders, detaching them after [`DRAIN_GRACE`]
    async fn drain(&mut self) {
        let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        for task in [self.stdout_task.take(), self.stderr_task.take()]
            .into_iter()
            .flatten()
        {
            let abort = task.abort_handle();
            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Output forwarder for {} failed: {}", self.job_id, e);
                }
                Err(_) => {
                    abort.abort();
                    tracing::warn!(
                        "Output of {} still held open after exit, detaching",
                        self.job_id
                    );
                }
            }
        }
    }
}

/// Copy a child stream into the log line by line
///
/// Lines are forwarded as raw bytes so non-UTF-8 output survives.
fn forward_output<R>(job_id: String, stream: R, log: JobLog) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if let Err(e) = log.append(&line) {
                        tracing::warn!(
                            "Failed to write log {} for {}: {}",
                            log.path().display(),
                            job_id,
                            e
                        );
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to read output of {}: {}", job_id, e);
                    break;
                }
            }
        }
    })
}
