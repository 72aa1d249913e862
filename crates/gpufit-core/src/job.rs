//! Job specifications, lifecycle phases and device masks

use serde::{Deserialize, Serialize};

use crate::{GpufitError, GpufitResult};

/// A command together with the GPU memory it needs across all its devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawJobSpec")]
pub struct JobSpec {
    /// Command line, tokenized on whitespace at launch
    pub command: String,
    /// Total GPU memory required in MB
    pub required_memory_mb: u64,
}

impl JobSpec {
    /// Create a job spec, rejecting blank commands and zero memory
    pub fn new(command: impl Into<String>, required_memory_mb: u64) -> GpufitResult<Self> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(GpufitError::InvalidJob("command is empty".to_string()));
        }
        if required_memory_mb == 0 {
            return Err(GpufitError::InvalidJob(format!(
                "job '{}' must require more than 0 MB",
                command
            )));
        }
        Ok(Self {
            command,
            required_memory_mb,
        })
    }
}

#[derive(Deserialize)]
struct RawJobSpec {
    command: String,
    required_memory_mb: u64,
}

impl TryFrom<RawJobSpec> for JobSpec {
    type Error = GpufitError;

    fn try_from(raw: RawJobSpec) -> GpufitResult<Self> {
        JobSpec::new(raw.command, raw.required_memory_mb)
    }
}

impl std::str::FromStr for JobSpec {
    type Err = GpufitError;

    /// Parse `MB:COMMAND`, e.g. `4000:python train.py`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (memory, command) = s.split_once(':').ok_or_else(|| {
            GpufitError::InvalidJob(format!("expected MB:COMMAND, got {:?}", s))
        })?;
        let memory: u64 = memory.trim().parse().map_err(|_| {
            GpufitError::InvalidJob(format!("memory must be an integer in MB, got {:?}", memory))
        })?;
        JobSpec::new(command.trim(), memory)
    }
}

/// Job lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    /// Not placed yet
    Pending,
    /// Process launched and tracked
    Running,
    /// Process exited successfully
    Finished,
    /// Process exited unsuccessfully
    Failed,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Finished | JobPhase::Failed)
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Pending => write!(f, "Pending"),
            JobPhase::Running => write!(f, "Running"),
            JobPhase::Finished => write!(f, "Finished"),
            JobPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Ordered set of device indices exposed to one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeviceMask(Vec<u32>);

impl DeviceMask {
    pub fn new(indices: Vec<u32>) -> Self {
        Self(indices)
    }

    pub fn indices(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Comma-joined form used for visibility environment variables
    pub fn to_env_value(&self) -> String {
        self.0
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl std::fmt::Display for DeviceMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_env_value())
    }
}
