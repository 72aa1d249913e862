//! GPU telemetry snapshots and backend identifiers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{GpufitError, GpufitResult};

/// Point-in-time memory reading for one GPU device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuSnapshot {
    /// Device index as reported by the vendor tool
    pub index: u32,
    /// Free memory in MB
    pub free_memory_mb: u64,
    /// Total memory in MB
    pub total_memory_mb: u64,
    /// When the reading was taken
    pub captured_at: DateTime<Utc>,
}

impl GpuSnapshot {
    /// Create a snapshot, rejecting readings where free exceeds total
    pub fn new(
        index: u32,
        free_memory_mb: u64,
        total_memory_mb: u64,
        captured_at: DateTime<Utc>,
    ) -> GpufitResult<Self> {
        if free_memory_mb > total_memory_mb {
            return Err(GpufitError::MalformedTelemetry {
                line: format!("{}, {}, {}", index, free_memory_mb, total_memory_mb),
                reason: "free memory exceeds total memory".to_string(),
            });
        }
        Ok(Self {
            index,
            free_memory_mb,
            total_memory_mb,
            captured_at,
        })
    }

    /// Same reading, ignoring the capture timestamp
    pub fn same_reading(&self, other: &GpuSnapshot) -> bool {
        self.index == other.index
            && self.free_memory_mb == other.free_memory_mb
            && self.total_memory_mb == other.total_memory_mb
    }
}

/// Telemetry backend identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryMode {
    Nvidia,
}

impl TelemetryMode {
    /// Environment variable restricting which devices a child process sees
    pub fn visibility_env_var(&self) -> &'static str {
        match self {
            TelemetryMode::Nvidia => "CUDA_VISIBLE_DEVICES",
        }
    }
}

impl FromStr for TelemetryMode {
    type Err = GpufitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "nvidia" => Ok(TelemetryMode::Nvidia),
            _ => Err(GpufitError::UnsupportedMode(s.to_string())),
        }
    }
}

impl std::fmt::Display for TelemetryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TelemetryMode::Nvidia => write!(f, "nvidia"),
        }
    }
}

/// Parse `index, free, total` CSV rows (no header, values in MB).
///
/// Blank lines are skipped. Every other line must hold exactly three
/// non-negative integers, otherwise the whole capture is rejected.
pub fn parse_memory_query(output: &str, captured_at: DateTime<Utc>) -> GpufitResult<Vec<GpuSnapshot>> {
    let mut snapshots = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 3 {
            return Err(GpufitError::MalformedTelemetry {
                line: line.to_string(),
                reason: format!("expected 3 fields, found {}", fields.len()),
            });
        }

        let malformed = |what: &str, value: &str| GpufitError::MalformedTelemetry {
            line: line.to_string(),
            reason: format!("{} is not an integer: {:?}", what, value),
        };

        let index: u32 = fields[0].parse().map_err(|_| malformed("index", fields[0]))?;
        let free: u64 = fields[1].parse().map_err(|_| malformed("free memory", fields[1]))?;
        let total: u64 = fields[2].parse().map_err(|_| malformed("total memory", fields[2]))?;

        snapshots.push(GpuSnapshot::new(index, free, total, captured_at)?);
    }

    Ok(snapshots)
}

/// Stable sort by descending free memory; equal devices keep their order
pub fn sort_most_free_first(snapshots: &mut [GpuSnapshot]) {
    snapshots.sort_by(|a, b| b.free_memory_mb.cmp(&a.free_memory_mb));
}

/// Summed total memory across devices
pub fn total_capacity_mb(snapshots: &[GpuSnapshot]) -> u64 {
    snapshots.iter().map(|s| s.total_memory_mb).sum()
}
