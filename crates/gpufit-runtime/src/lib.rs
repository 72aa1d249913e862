//! gpufit-runtime: Process management for gpufit
//!
//! This crate provides everything that touches child processes:
//! - Process launcher (synchronous and pollable asynchronous modes)
//! - Command mutators applied before launch
//! - Tracked-process registry
//! - Lifecycle guard that kills jobs on SIGINT/SIGTERM

pub mod guard;
pub mod mutators;
pub mod process;
pub mod registry;
pub mod traits;

pub use guard::LifecycleGuard;
pub use mutators::{build_mutators, find_free_ports, FreePortMutator};
pub use process::{
    CapturedOutput, CompletedProcess, ExitOutcome, LaunchRequest, ProcessHandle, ProcessLauncher,
    StreamPolicy,
};
pub use registry::{ProcessRegistry, TeardownReport};
pub use traits::{CommandMutator, Launcher};
