//! gpufit-core: Core types for the gpufit scheduler
//!
//! This crate provides the fundamental types used throughout gpufit:
//! - GPU telemetry snapshots and backend identifiers
//! - Job specifications, phases and device masks
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod gpu;
pub mod job;

pub use config::*;
pub use error::*;
pub use gpu::*;
pub use job::*;
