//! GPU memory telemetry backends

use async_trait::async_trait;
use chrono::Utc;
use gpufit_core::{
    parse_memory_query, sort_most_free_first, GpufitError, GpufitResult, GpuSnapshot,
    TelemetryConfig, TelemetryMode,
};
use gpufit_runtime::{LaunchRequest, Launcher};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Source of per-device memory readings
#[async_trait]
pub trait TelemetryBackend: Send + Sync {
    /// Read every visible device, most free memory first
    async fn capture(&self) -> GpufitResult<Vec<GpuSnapshot>>;

    /// Backend identifier
    fn mode(&self) -> TelemetryMode;
}

/// Reads memory through `nvidia-smi`
pub struct NvidiaSmiTelemetry {
    launcher: Arc<dyn Launcher>,
    binary: PathBuf,
}

impl NvidiaSmiTelemetry {
    pub fn new(launcher: Arc<dyn Launcher>, binary: PathBuf) -> Self {
        Self { launcher, binary }
    }

    fn query_command(&self) -> String {
        format!(
            "{} --query-gpu=index,memory.free,memory.total --format=csv,noheader,nounits",
            self.binary.display()
        )
    }
}

#[async_trait]
impl TelemetryBackend for NvidiaSmiTelemetry {
    async fn capture(&self) -> GpufitResult<Vec<GpuSnapshot>> {
        let done = self
            .launcher
            .run(LaunchRequest::new(self.query_command()))
            .await
            .map_err(|e| GpufitError::TelemetryUnavailable(e.to_string()))?;

        if !done.success() {
            return Err(GpufitError::TelemetryUnavailable(format!(
                "'{}' exited with {:?}: {}",
                done.command,
                done.outcome.code,
                done.stderr.trim()
            )));
        }

        let mut snapshots = parse_memory_query(&done.stdout, Utc::now())?;
        sort_most_free_first(&mut snapshots);

        debug!(
            devices = snapshots.len(),
            free_mb = ?snapshots.iter().map(|s| s.free_memory_mb).collect::<Vec<_>>(),
            "Captured GPU telemetry"
        );

        Ok(snapshots)
    }

    fn mode(&self) -> TelemetryMode {
        TelemetryMode::Nvidia
    }
}

/// Build the backend named by the configured mode
pub fn backend_for(
    config: &TelemetryConfig,
    launcher: Arc<dyn Launcher>,
) -> GpufitResult<Arc<dyn TelemetryBackend>> {
    match config.mode()? {
        TelemetryMode::Nvidia => Ok(Arc::new(NvidiaSmiTelemetry::new(
            launcher,
            config.query_binary.clone(),
        ))),
    }
}
