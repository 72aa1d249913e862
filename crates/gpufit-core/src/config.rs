//! Configuration types for gpufit

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{GpufitError, GpufitResult, JobSpec, TelemetryMode};

/// One week
pub const DEFAULT_TIMEOUT_SECS: u64 = 60 * 60 * 24 * 7;
pub const DEFAULT_PLACEMENT_DELAY_SECS: u64 = 3;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GpufitConfig {
    /// Scheduling loop parameters
    pub scheduler: SchedulerConfig,
    /// Telemetry backend selection
    pub telemetry: TelemetryConfig,
    /// Process launch settings
    pub launcher: LauncherConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl GpufitConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> GpufitResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GpufitError::Config(format!("Failed to read config file: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| GpufitError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// What to do once a launched job exits unsuccessfully
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Report the failure and keep placing and monitoring the other jobs
    #[default]
    Continue,
    /// Stop the run at the first failure
    Halt,
}

/// Scheduling loop parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Wall-clock budget for the whole run
    pub timeout_secs: u64,
    /// Pause after each placement so telemetry reflects the new job
    pub placement_delay_secs: u64,
    /// Pause between iterations that placed nothing
    pub poll_interval_ms: u64,
    /// Reaction to a job exiting unsuccessfully
    pub failure_policy: FailurePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            placement_delay_secs: DEFAULT_PLACEMENT_DELAY_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            failure_policy: FailurePolicy::Continue,
        }
    }
}

impl SchedulerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn placement_delay(&self) -> Duration {
        Duration::from_secs(self.placement_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Telemetry backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Backend identifier (only "nvidia" is supported)
    pub mode: String,
    /// Path or name of the vendor query tool
    pub query_binary: PathBuf,
    /// Overrides the backend's device-visibility variable
    pub visibility_env: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            mode: "nvidia".to_string(),
            query_binary: PathBuf::from("nvidia-smi"),
            visibility_env: None,
        }
    }
}

impl TelemetryConfig {
    pub fn mode(&self) -> GpufitResult<TelemetryMode> {
        self.mode.parse()
    }

    /// Variable name carrying the device mask to launched jobs
    pub fn visibility_env_var(&self) -> GpufitResult<String> {
        match &self.visibility_env {
            Some(var) => Ok(var.clone()),
            None => Ok(self.mode()?.visibility_env_var().to_string()),
        }
    }
}

/// Process launch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Keep job stdout so it can be reported on failure
    pub capture_stdout: bool,
    /// Keep job stderr so it can be reported on failure
    pub capture_stderr: bool,
    /// Command rewrites applied before every launch, in order
    pub mutators: Vec<MutatorConfig>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            capture_stdout: true,
            capture_stderr: true,
            mutators: Vec::new(),
        }
    }
}

/// Configurable command mutators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MutatorConfig {
    /// Insert `<flag>=<free port>` right after `marker`
    FreePort {
        #[serde(default = "default_port_marker")]
        marker: String,
        #[serde(default = "default_port_flag")]
        flag: String,
    },
}

pub fn default_port_marker() -> String {
    "torch.distributed.launch".to_string()
}

pub fn default_port_flag() -> String {
    "--master_port".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Job file format (TOML)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFile {
    #[serde(default)]
    pub jobs: Vec<JobEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    pub command: String,
    pub memory_mb: u64,
}

impl JobFile {
    /// Load a job file from disk
    pub fn from_file(path: &Path) -> GpufitResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GpufitError::Config(format!("Failed to read job file: {}", e)))?;
        Ok(toml::from_str(&content)?)
    }

    /// Validate entries into job specs, keeping file order
    pub fn into_specs(self) -> GpufitResult<Vec<JobSpec>> {
        self.jobs
            .into_iter()
            .map(|entry| JobSpec::new(entry.command, entry.memory_mb))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = GpufitConfig::default();
        assert_eq!(config.scheduler.timeout_secs, 604800);
        assert_eq!(config.scheduler.placement_delay(), Duration::from_secs(3));
        assert_eq!(config.scheduler.failure_policy, FailurePolicy::Continue);
        assert_eq!(config.telemetry.mode, "nvidia");
        assert!(config.launcher.capture_stdout);
    }

    #[test]
    fn test_partial_config_parse() {
        let toml_str = r#"
[scheduler]
timeout_secs = 3600
failure_policy = "halt"

[telemetry]
query_binary = "/usr/bin/nvidia-smi"

[[launcher.mutators]]
kind = "free-port"
"#;
        let config: GpufitConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduler.timeout_secs, 3600);
        assert_eq!(config.scheduler.placement_delay_secs, 3);
        assert_eq!(config.scheduler.failure_policy, FailurePolicy::Halt);
        assert_eq!(config.telemetry.query_binary, PathBuf::from("/usr/bin/nvidia-smi"));
        assert_eq!(
            config.launcher.mutators,
            vec![MutatorConfig::FreePort {
                marker: "torch.distributed.launch".to_string(),
                flag: "--master_port".to_string(),
            }]
        );
    }

    #[test]
    fn test_visibility_env_var() {
        let mut telemetry = TelemetryConfig::default();
        assert_eq!(telemetry.visibility_env_var().unwrap(), "CUDA_VISIBLE_DEVICES");

        telemetry.visibility_env = Some("HIP_VISIBLE_DEVICES".to_string());
        assert_eq!(telemetry.visibility_env_var().unwrap(), "HIP_VISIBLE_DEVICES");

        telemetry.mode = "tpu".to_string();
        assert!(matches!(telemetry.mode(), Err(GpufitError::UnsupportedMode(_))));
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"").unwrap();
        let config = GpufitConfig::from_file(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_config_from_missing_file() {
        let err = GpufitConfig::from_file(Path::new("/nonexistent/gpufit.toml")).unwrap_err();
        assert!(matches!(err, GpufitError::Config(_)));
    }

    #[test]
    fn test_job_file_parse() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[jobs]]
command = "python train.py --lr 0.1"
memory_mb = 8000

[[jobs]]
command = "python eval.py"
memory_mb = 2000
"#
        )
        .unwrap();

        let specs = JobFile::from_file(file.path()).unwrap().into_specs().unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].required_memory_mb, 8000);
        assert_eq!(specs[1].command, "python eval.py");
    }

    #[test]
    fn test_job_file_rejects_zero_memory() {
        let file: JobFile = toml::from_str("[[jobs]]\ncommand = \"x\"\nmemory_mb = 0").unwrap();
        assert!(matches!(file.into_specs(), Err(GpufitError::InvalidJob(_))));
    }
}
