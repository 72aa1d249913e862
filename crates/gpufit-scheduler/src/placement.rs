//! Job placement decisions

use gpufit_core::{DeviceMask, GpuSnapshot, JobSpec};

/// Placement decision for a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementDecision {
    /// Devices the job may see
    pub devices: DeviceMask,
    /// Number of leading snapshot entries claimed
    pub prefix_len: usize,
    /// Weighted prefix score that admitted the job
    pub score: u64,
}

/// Strategy for making placement decisions
pub trait PlacementStrategy: Send + Sync {
    /// Pick devices for `job` from a snapshot ordered most free first
    fn place(&self, job: &JobSpec, snapshot: &[GpuSnapshot]) -> Option<PlacementDecision>;
}

/// `score[i] = (i + 1) * free[i]` over a most-free-first snapshot.
///
/// Approximates the memory available when claiming the first `i + 1`
/// devices without summing them.
pub fn weighted_prefix_scores(snapshot: &[GpuSnapshot]) -> Vec<u64> {
    snapshot
        .iter()
        .enumerate()
        .map(|(i, gpu)| (i as u64 + 1).saturating_mul(gpu.free_memory_mb))
        .collect()
}

/// Claims the shortest prefix whose weighted score strictly exceeds the job's requirement
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedPrefixStrategy;

impl PlacementStrategy for WeightedPrefixStrategy {
    fn place(&self, job: &JobSpec, snapshot: &[GpuSnapshot]) -> Option<PlacementDecision> {
        let scores = weighted_prefix_scores(snapshot);
        let position = scores
            .iter()
            .position(|score| *score > job.required_memory_mb)?;

        Some(PlacementDecision {
            devices: DeviceMask::new(snapshot[..=position].iter().map(|gpu| gpu.index).collect()),
            prefix_len: position + 1,
            score: scores[position],
        })
    }
}

/// Indices of `jobs` in placement order: largest requirement first,
/// submission order among equals
pub fn placement_order(jobs: &[JobSpec]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..jobs.len()).collect();
    order.sort_by(|a, b| jobs[*b].required_memory_mb.cmp(&jobs[*a].required_memory_mb));
    order
}
