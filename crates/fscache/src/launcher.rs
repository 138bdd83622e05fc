//! Starting scan workers.
//!
//! A launched worker runs detached from the dispatcher and reports its result
//! through the worker-result endpoint. The dispatcher only keeps the join
//! handle, to reap it and to notice crashes.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context};
use fscache_worker::{run_and_submit, CancellationToken};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Isolation;
use crate::jobs::Job;

pub type WorkerHandle = JoinHandle<anyhow::Result<()>>;

pub trait ScanLauncher: Send + Sync {
    /// Start one scan of `job`. Must not block.
    ///
    /// The worker should stop early once `cancel` fires; the dispatcher
    /// aborts the handle afterwards either way.
    fn launch(&self, job: &Job, cancel: CancellationToken) -> WorkerHandle;
}

/// Build the launcher for an isolation mode.
pub fn launcher_for(isolation: &Isolation, result_addr: &str) -> Box<dyn ScanLauncher> {
    match isolation {
        Isolation::Task => Box::new(TaskLauncher::new(result_addr)),
        Isolation::Process { worker_exe } => {
            Box::new(ProcessLauncher::new(worker_exe.clone(), result_addr))
        }
    }
}

/// Scans on tokio's blocking pool inside the daemon.
pub struct TaskLauncher {
    result_addr: String,
}

impl TaskLauncher {
    pub fn new(result_addr: impl Into<String>) -> Self {
        Self {
            result_addr: result_addr.into(),
        }
    }
}

impl ScanLauncher for TaskLauncher {
    fn launch(&self, job: &Job, cancel: CancellationToken) -> WorkerHandle {
        let scan = job.scan_job();
        let result_addr = self.result_addr.clone();
        tokio::spawn(async move {
            run_and_submit(scan, &result_addr, cancel).await?;
            Ok(())
        })
    }
}

/// Scans in a child `fscache-worker` process.
pub struct ProcessLauncher {
    worker_exe: PathBuf,
    result_addr: String,
}

impl ProcessLauncher {
    pub fn new(worker_exe: PathBuf, result_addr: impl Into<String>) -> Self {
        Self {
            worker_exe,
            result_addr: result_addr.into(),
        }
    }

    fn command(&self, job: &Job) -> Command {
        let mut cmd = Command::new(&self.worker_exe);
        cmd.arg("--job")
            .arg(&job.name)
            .arg("--root")
            .arg(&job.root)
            .arg("--pattern")
            .arg(job.pattern.as_str())
            .arg("--capture")
            .arg(job.capture.as_str())
            .arg("--result-addr")
            .arg(&self.result_addr)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

impl ScanLauncher for ProcessLauncher {
    fn launch(&self, job: &Job, cancel: CancellationToken) -> WorkerHandle {
        let mut cmd = self.command(job);
        let name = job.name.clone();
        let exe = self.worker_exe.clone();

        tokio::spawn(async move {
            let mut child = cmd
                .spawn()
                .with_context(|| format!("Failed to spawn worker {}", exe.display()))?;
            debug!("Job '{}': worker pid {:?}", name, child.id());

            tokio::select! {
                status = child.wait() => {
                    let status = status.context("Failed to wait for worker")?;
                    if !status.success() {
                        bail!("worker for job '{}' exited with {}", name, status);
                    }
                    Ok(())
                }
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill worker for job '{}': {}", name, e);
                    }
                    bail!("worker for job '{}' was terminated", name);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobRegistry, JobSpec};
    use fscache_worker::CaptureMode;

    fn job() -> Job {
        JobRegistry::builder()
            .add(
                JobSpec::new("grains", "/var/cache/minions", r".*/data\.p$", [2])
                    .with_capture(CaptureMode::Metadata),
            )
            .unwrap()
            .build()
            .jobs()[0]
            .clone()
    }

    #[test]
    fn test_process_command_line() {
        let launcher = ProcessLauncher::new(PathBuf::from("/opt/fscache-worker"), "ipc:///tmp/upd");
        let cmd = launcher.command(&job());
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), "/opt/fscache-worker");
        let args: Vec<_> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--job",
                "grains",
                "--root",
                "/var/cache/minions",
                "--pattern",
                r".*/data\.p$",
                "--capture",
                "metadata",
                "--result-addr",
                "ipc:///tmp/upd",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_worker_exe_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(dir.path().join("nope"), "ipc:///tmp/upd");
        let result = launcher.launch(&job(), CancellationToken::new()).await.unwrap();
        assert!(result.is_err());
    }

    /// Executable shell script standing in for `fscache-worker`.
    #[cfg(unix)]
    fn script(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("worker.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(script(dir.path(), "exit 1"), "ipc:///tmp/upd");

        let err = launcher
            .launch(&job(), CancellationToken::new())
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("exited with"), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_zero_exit_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(script(dir.path(), "exit 0"), "ipc:///tmp/upd");
        let result = launcher.launch(&job(), CancellationToken::new()).await.unwrap();
        assert!(result.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_child_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(script(dir.path(), "sleep 30"), "ipc:///tmp/upd");

        let cancel = CancellationToken::new();
        let handle = launcher.launch(&job(), cancel.clone());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();

        let err = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("child was not killed")
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("terminated"), "{err}");
    }

    #[tokio::test]
    async fn test_task_launcher_reports_cancelled_scan_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let spec = JobSpec::new("j", dir.path(), ".*", [1]);
        let job = JobRegistry::builder().add(spec).unwrap().build().jobs()[0].clone();

        // Cancelled up front: the scan stops and nothing is submitted.
        let cancel = CancellationToken::new();
        cancel.cancel();
        let launcher = TaskLauncher::new("ipc:///nonexistent/upd");
        let result = launcher.launch(&job, cancel).await.unwrap();
        assert!(result.is_err());
    }
}
