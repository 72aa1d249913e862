//! Tracked-process registry shared by the scheduler and the lifecycle guard
//!
//! The scheduler launches jobs through the registry, so spawning and tracking
//! happen under one lock; the guard drains the registry on a termination
//! signal and kills what it finds. Once drained the registry is closed: new
//! launches are refused and anything tracked afterwards is killed on arrival.

use gpufit_core::{GpufitError, GpufitResult};
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::process::{LaunchRequest, ProcessHandle};
use crate::traits::Launcher;

/// Registry view of a launched child
#[derive(Clone)]
pub struct TrackedProcess {
    id: Uuid,
    pid: Option<u32>,
    command: String,
    child: Arc<Mutex<Child>>,
}

impl TrackedProcess {
    pub(crate) fn new(id: Uuid, pid: Option<u32>, command: String, child: Arc<Mutex<Child>>) -> Self {
        Self {
            id,
            pid,
            command,
            child,
        }
    }

    async fn terminate(&self) -> KillResult {
        let mut child = self.child.lock().await;

        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(process_id = %self.id, status = %status, "Process already exited");
                return KillResult::AlreadyExited;
            }
            Ok(None) => {}
            Err(e) => {
                debug!(process_id = %self.id, error = %e, "Could not poll process before kill");
            }
        }

        match child.start_kill() {
            Ok(()) => {
                info!(process_id = %self.id, pid = ?self.pid, command = %self.command, "Killed process");
                KillResult::Killed
            }
            Err(e) => {
                warn!(
                    process_id = %self.id,
                    pid = ?self.pid,
                    error = %e,
                    "Process killing not successful"
                );
                KillResult::Failed
            }
        }
    }
}

enum KillResult {
    Killed,
    AlreadyExited,
    Failed,
}

/// Counts from one teardown pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub killed: usize,
    pub already_exited: usize,
    pub failed: usize,
}

impl TeardownReport {
    pub fn total(&self) -> usize {
        self.killed + self.already_exited + self.failed
    }
}

#[derive(Default)]
struct RegistryState {
    processes: Vec<TrackedProcess>,
    closed: bool,
}

/// Cloneable handle to the set of processes that must not outlive gpufit
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ProcessRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a launched process until teardown
    pub async fn track(&self, handle: &ProcessHandle) {
        let tracked = handle.tracked();
        let mut state = self.state.lock().await;

        if state.closed {
            warn!(process_id = %tracked.id, "Registry already torn down, killing late process");
            tracked.terminate().await;
            return;
        }

        debug!(process_id = %tracked.id, pid = ?tracked.pid, "Tracking process");
        state.processes.push(tracked);
    }

    /// Launch a process and track it without releasing the registry lock.
    ///
    /// A teardown can therefore never run between the spawn and the track.
    /// Fails with `LaunchFailure` once the registry has been torn down.
    pub async fn launch_tracked(
        &self,
        launcher: &dyn Launcher,
        request: LaunchRequest,
    ) -> GpufitResult<ProcessHandle> {
        let mut state = self.state.lock().await;

        if state.closed {
            return Err(GpufitError::LaunchFailure(format!(
                "'{}' not started: shutting down",
                request.command
            )));
        }

        let handle = launcher.launch(request).await?;
        let tracked = handle.tracked();
        debug!(process_id = %tracked.id, pid = ?tracked.pid, "Tracking process");
        state.processes.push(tracked);
        Ok(handle)
    }

    /// Number of tracked processes
    pub async fn len(&self) -> usize {
        self.state.lock().await.processes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Ids of tracked processes in launch order
    pub async fn tracked_ids(&self) -> Vec<Uuid> {
        self.state.lock().await.processes.iter().map(|p| p.id).collect()
    }

    /// Kill every tracked process exactly once and close the registry.
    ///
    /// Failures are logged and counted, never returned.
    pub async fn kill_all(&self) -> TeardownReport {
        let mut state = self.state.lock().await;
        state.closed = true;
        let processes = std::mem::take(&mut state.processes);

        let mut report = TeardownReport::default();
        for process in &processes {
            match process.terminate().await {
                KillResult::Killed => report.killed += 1,
                KillResult::AlreadyExited => report.already_exited += 1,
                KillResult::Failed => report.failed += 1,
            }
        }

        info!(
            killed = report.killed,
            already_exited = report.already_exited,
            failed = report.failed,
            "Tracked processes torn down"
        );

        report
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::{LaunchRequest, ProcessLauncher};
    use crate::traits::Launcher;
    use std::time::Duration;

    async fn exited(handle: &ProcessHandle) {
        while handle.try_exit().await.unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_kill_all_empty_registry() {
        let registry = ProcessRegistry::new();
        assert!(registry.is_empty().await);
        assert_eq!(registry.kill_all().await, TeardownReport::default());
    }

    #[tokio::test]
    async fn test_kill_all_kills_once() {
        let launcher = ProcessLauncher::new();
        let registry = ProcessRegistry::new();

        let sleeper = launcher.launch(LaunchRequest::new("sleep 30")).await.unwrap();
        registry.track(&sleeper).await;
        assert_eq!(registry.tracked_ids().await, vec![sleeper.id()]);

        let report = registry.kill_all().await;
        assert_eq!(report.killed, 1);
        assert!(registry.is_empty().await);

        exited(&sleeper).await;
        assert!(!sleeper.try_exit().await.unwrap().unwrap().success);

        // A second teardown finds nothing left
        assert_eq!(registry.kill_all().await.total(), 0);
    }

    #[tokio::test]
    async fn test_kill_all_tolerates_exited_process() {
        let launcher = ProcessLauncher::new();
        let registry = ProcessRegistry::new();

        let quick = launcher.launch(LaunchRequest::new("true")).await.unwrap();
        registry.track(&quick).await;
        exited(&quick).await;

        let report = registry.kill_all().await;
        assert_eq!(report.already_exited, 1);
        assert_eq!(report.killed, 0);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_launch_tracked_registers_process() {
        let launcher = ProcessLauncher::new();
        let registry = ProcessRegistry::new();

        let handle = registry
            .launch_tracked(&launcher, LaunchRequest::new("sleep 30"))
            .await
            .unwrap();
        assert_eq!(registry.tracked_ids().await, vec![handle.id()]);

        assert_eq!(registry.kill_all().await.killed, 1);
        exited(&handle).await;
    }

    #[tokio::test]
    async fn test_launch_tracked_refused_after_teardown() {
        let launcher = ProcessLauncher::new();
        let registry = ProcessRegistry::new();
        registry.kill_all().await;

        let err = registry
            .launch_tracked(&launcher, LaunchRequest::new("sleep 30"))
            .await
            .unwrap_err();
        assert!(matches!(err, GpufitError::LaunchFailure(msg) if msg.contains("shutting down")));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_teardown_waits_for_inflight_launch() {
        let launcher = ProcessLauncher::new();
        let registry = ProcessRegistry::new();

        let launching = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .launch_tracked(&launcher, LaunchRequest::new("sleep 30"))
                    .await
            })
        };
        let report = registry.kill_all().await;

        // Either the launch won the lock and was killed, or it was refused
        match launching.await.unwrap() {
            Ok(handle) => {
                assert_eq!(report.killed, 1);
                exited(&handle).await;
            }
            Err(e) => {
                assert_eq!(report.total(), 0);
                assert!(matches!(e, GpufitError::LaunchFailure(_)));
            }
        }
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_track_after_teardown_kills_process() {
        let launcher = ProcessLauncher::new();
        let registry = ProcessRegistry::new();
        registry.kill_all().await;

        let late = launcher.launch(LaunchRequest::new("sleep 30")).await.unwrap();
        registry.track(&late).await;
        assert!(registry.is_empty().await);

        exited(&late).await;
        assert!(!late.try_exit().await.unwrap().unwrap().success);
    }
}
