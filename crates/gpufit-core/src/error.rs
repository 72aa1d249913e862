//! Error types for gpufit

use thiserror::Error;

/// Main error type for gpufit
#[derive(Error, Debug)]
pub enum GpufitError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The GPU query tool is missing or reported an error
    #[error("GPU telemetry unavailable: {0}")]
    TelemetryUnavailable(String),

    /// The GPU query tool produced output that could not be parsed
    #[error("Malformed GPU telemetry line {line:?}: {reason}")]
    MalformedTelemetry { line: String, reason: String },

    /// Unknown telemetry backend identifier
    #[error("Unsupported telemetry mode: {0}")]
    UnsupportedMode(String),

    /// The largest job can never fit on the visible devices
    #[error(
        "Job '{command}' requires {required_mb} MB but the visible GPUs only have {capacity_mb} MB in total"
    )]
    InfeasibleJob {
        command: String,
        required_mb: u64,
        capacity_mb: u64,
    },

    /// Job specification rejected at construction
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// A process could not be spawned
    #[error("Launch failure: {0}")]
    LaunchFailure(String),

    /// A command mutator could not rewrite the command
    #[error("Command mutator error: {0}")]
    Mutator(String),

    /// A launched job exited unsuccessfully
    #[error("Job '{command}' failed with exit code {}", display_code(.exit_code))]
    JobRuntimeFailure {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// The run exceeded its wall-clock budget
    #[error(
        "Scheduling timed out after {timeout_secs}s with {pending} pending and {running} running jobs"
    )]
    SchedulingTimeout {
        timeout_secs: u64,
        pending: usize,
        running: usize,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}

/// Result type for gpufit operations
pub type GpufitResult<T> = Result<T, GpufitError>;

impl From<toml::de::Error> for GpufitError {
    fn from(err: toml::de::Error) -> Self {
        GpufitError::Config(err.to_string())
    }
}
