//! gpufit-scheduler: GPU-memory-aware job scheduler
//!
//! This crate decides where and when jobs run:
//! - GPU memory telemetry backends
//! - Weighted-prefix placement decisions
//! - The scheduling loop that launches, polls and times out jobs

pub mod placement;
pub mod scheduler;
pub mod telemetry;

pub use placement::{
    placement_order, weighted_prefix_scores, PlacementDecision, PlacementStrategy,
    WeightedPrefixStrategy,
};
pub use scheduler::{JobOutcome, JobState, PlacementRecord, RunReport, Scheduler};
pub use telemetry::{backend_for, NvidiaSmiTelemetry, TelemetryBackend};
