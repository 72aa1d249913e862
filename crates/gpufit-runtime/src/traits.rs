//! Launcher and command mutator trait definitions

use async_trait::async_trait;
use gpufit_core::GpufitResult;

use crate::process::{CompletedProcess, LaunchRequest, ProcessHandle};

/// Launcher trait for starting external commands
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start the command and return immediately with a pollable handle
    async fn launch(&self, request: LaunchRequest) -> GpufitResult<ProcessHandle>;

    /// Start the command and wait for it to finish
    async fn run(&self, request: LaunchRequest) -> GpufitResult<CompletedProcess>;

    /// Get the launcher name
    fn name(&self) -> &'static str;
}

/// Rewrites a command string before it is tokenized and spawned.
///
/// Called exactly once per launch attempt, so implementations may allocate
/// a fresh resource (such as a port) on every call.
pub trait CommandMutator: Send + Sync {
    fn mutate(&self, command: &str) -> GpufitResult<String>;
}

impl<F> CommandMutator for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn mutate(&self, command: &str) -> GpufitResult<String> {
        Ok(self(command))
    }
}
