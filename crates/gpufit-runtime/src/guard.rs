//! Signal-driven teardown of launched jobs
//!
//! The guard listens for SIGINT and SIGTERM (Ctrl-C on other platforms). On
//! the first signal it kills everything in the [`ProcessRegistry`] and, unless
//! installed with [`LifecycleGuard::install_without_exit`], exits with status 0.

use gpufit_core::{GpufitError, GpufitResult};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::registry::{ProcessRegistry, TeardownReport};

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        "CTRL-C"
    }
}

/// Background task that kills tracked jobs when gpufit is told to stop
pub struct LifecycleGuard {
    task: Option<JoinHandle<TeardownReport>>,
}

impl LifecycleGuard {
    /// Install the handlers; the process exits after teardown
    pub fn install(registry: ProcessRegistry) -> GpufitResult<Self> {
        Self::spawn(registry, true)
    }

    /// Install the handlers; teardown is reported through [`LifecycleGuard::wait`]
    pub fn install_without_exit(registry: ProcessRegistry) -> GpufitResult<Self> {
        Self::spawn(registry, false)
    }

    fn spawn(registry: ProcessRegistry, exit_process: bool) -> GpufitResult<Self> {
        // Register before returning so no signal slips past
        let mut signals = Signals::install()?;

        let task = tokio::spawn(async move {
            let signal = signals.recv().await;
            warn!(signal = signal, "Termination signal received, killing launched jobs");

            let report = registry.kill_all().await;

            if exit_process {
                info!(killed = report.killed, "Exiting after teardown");
                std::process::exit(0);
            }
            report
        });

        Ok(Self { task: Some(task) })
    }

    /// Wait for a signal-driven teardown to finish
    pub async fn wait(mut self) -> GpufitResult<TeardownReport> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| GpufitError::Internal(format!("Lifecycle guard task failed: {}", e))),
            None => Err(GpufitError::Internal("Lifecycle guard already consumed".to_string())),
        }
    }
}

impl Drop for LifecycleGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
