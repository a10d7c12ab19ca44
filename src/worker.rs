//! Worker processes and the per-subscriber lifecycle states.
//!
//! The launcher is a seam so the supervisor can be exercised in tests
//! without real processes; production uses [`ProcessLauncher`] on top of
//! `tokio::process`.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::debug;
use uuid::Uuid;

use crate::error::SpawnError;

/// Lifecycle states for one subscriber's worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl WorkerState {
    /// States in which the subscriber may still own a live process.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            WorkerState::Starting | WorkerState::Running | WorkerState::Stopping
        )
    }
}

/// How a worker process ended.
#[derive(Debug, Clone)]
pub enum WorkerExit {
    Clean,
    Crashed { detail: String },
}

/// Everything the launcher needs to bring one worker up.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub subscriber_id: Uuid,
    pub artifact_path: PathBuf,
}

/// Seam for spawning worker processes.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>, SpawnError>;
}

/// An owned, running worker process. The supervisor's monitor task is the
/// sole owner; nothing else touches the handle.
#[async_trait]
pub trait WorkerProcess: Send {
    /// Wait for the process to exit. Must be cancel-safe: the monitor polls
    /// this inside a select loop and may re-call it after a cancelled poll.
    async fn wait(&mut self) -> WorkerExit;
    /// Ask the process to shut down gracefully.
    async fn terminate(&mut self);
    /// Force-kill the process.
    async fn kill(&mut self);
    fn pid(&self) -> Option<u32>;
}

/// Spawns real worker processes bound to their config artifact.
pub struct ProcessLauncher {
    worker_bin: PathBuf,
}

impl ProcessLauncher {
    pub fn new(worker_bin: PathBuf) -> Self {
        Self { worker_bin }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>, SpawnError> {
        let child = Command::new(&self.worker_bin)
            .arg("trade")
            .arg("--config")
            .arg(&spec.artifact_path)
            .arg("--user")
            .arg(spec.subscriber_id.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        debug!(
            subscriber = %spec.subscriber_id,
            pid = child.id(),
            "spawned worker process"
        );

        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    async fn wait(&mut self) -> WorkerExit {
        match self.child.wait().await {
            Ok(status) if status.success() => WorkerExit::Clean,
            Ok(status) => WorkerExit::Crashed {
                detail: status.to_string(),
            },
            Err(e) => WorkerExit::Crashed {
                detail: e.to_string(),
            },
        }
    }

    async fn terminate(&mut self) {
        #[cfg(unix)]
        {
            // SIGTERM first so the worker can wind down open positions.
            if let Some(pid) = self.child.id() {
                let _ = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                return;
            }
        }
        let _ = self.child.start_kill();
    }

    async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states() {
        assert!(WorkerState::Starting.is_active());
        assert!(WorkerState::Running.is_active());
        assert!(WorkerState::Stopping.is_active());
        assert!(!WorkerState::Stopped.is_active());
        assert!(!WorkerState::Failed.is_active());
    }

    #[tokio::test]
    async fn test_spawn_of_missing_binary_is_spawn_error() {
        let launcher = ProcessLauncher::new(PathBuf::from("/nonexistent/trade-worker"));
        let spec = LaunchSpec {
            subscriber_id: Uuid::new_v4(),
            artifact_path: PathBuf::from("/tmp/unused.json"),
        };
        assert!(launcher.spawn(&spec).await.is_err());
    }
}
