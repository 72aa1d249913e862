//! Command mutators applied by the launcher before tokenization

use gpufit_core::{GpufitError, GpufitResult, MutatorConfig};
use std::net::TcpListener;
use std::sync::Arc;
use tracing::debug;

use crate::traits::CommandMutator;

/// Find `count` distinct TCP ports that are free right now.
///
/// The sockets are released before returning, so another process may grab a
/// port before the job binds it.
pub fn find_free_ports(count: usize) -> GpufitResult<Vec<u16>> {
    let mut listeners = Vec::with_capacity(count);
    for _ in 0..count {
        listeners.push(TcpListener::bind(("0.0.0.0", 0))?);
    }

    listeners
        .iter()
        .map(|listener| -> GpufitResult<u16> { Ok(listener.local_addr()?.port()) })
        .collect()
}

/// Inserts `<flag>=<free port>` right after a marker token. Commands without
/// the marker pass through unchanged.
///
/// With the defaults, `python -m torch.distributed.launch train.py` becomes
/// `python -m torch.distributed.launch --master_port=41234 train.py`.
#[derive(Debug, Clone)]
pub struct FreePortMutator {
    marker: String,
    flag: String,
}

impl FreePortMutator {
    pub fn new(marker: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            flag: flag.into(),
        }
    }
}

impl Default for FreePortMutator {
    fn default() -> Self {
        Self::new(
            gpufit_core::default_port_marker(),
            gpufit_core::default_port_flag(),
        )
    }
}

impl CommandMutator for FreePortMutator {
    fn mutate(&self, command: &str) -> GpufitResult<String> {
        let mut parts: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        let Some(position) = parts.iter().position(|part| *part == self.marker) else {
            debug!(marker = %self.marker, command = %command, "No marker, command left unchanged");
            return Ok(command.to_string());
        };

        let port = find_free_ports(1)?
            .pop()
            .ok_or_else(|| GpufitError::Internal("no port returned".to_string()))?;
        let flag = format!("{}={}", self.flag, port);
        debug!(port = port, "Injecting free port");

        parts.insert(position + 1, flag);
        Ok(parts.join(" "))
    }
}

/// Instantiate the mutators named in configuration, keeping their order
pub fn build_mutators(configs: &[MutatorConfig]) -> Vec<Arc<dyn CommandMutator>> {
    configs
        .iter()
        .map(|config| match config {
            MutatorConfig::FreePort { marker, flag } => {
                Arc::new(FreePortMutator::new(marker.clone(), flag.clone())) as Arc<dyn CommandMutator>
            }
        })
        .collect()
}
