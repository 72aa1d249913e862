//! CLI commands implementation

use anyhow::{Context, Result};
use gpufit_core::{total_capacity_mb, FailurePolicy, GpuSnapshot, GpufitConfig, JobFile, JobSpec, MutatorConfig};
use gpufit_runtime::{
    build_mutators, LifecycleGuard, Launcher, ProcessLauncher, ProcessRegistry, StreamPolicy,
};
use gpufit_scheduler::{
    backend_for, placement_order, PlacementStrategy, RunReport, Scheduler, TelemetryBackend,
    WeightedPrefixStrategy,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Command-line values that take precedence over the config file
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub timeout_secs: Option<u64>,
    pub placement_delay_secs: Option<u64>,
    pub mode: Option<String>,
    pub free_port: bool,
    pub halt_on_failure: bool,
}

impl RunOverrides {
    pub fn apply(&self, config: &mut GpufitConfig) {
        if let Some(timeout) = self.timeout_secs {
            config.scheduler.timeout_secs = timeout;
        }
        if let Some(delay) = self.placement_delay_secs {
            config.scheduler.placement_delay_secs = delay;
        }
        if let Some(mode) = &self.mode {
            config.telemetry.mode = mode.clone();
        }
        if self.halt_on_failure {
            config.scheduler.failure_policy = FailurePolicy::Halt;
        }
        if self.free_port
            && !config
                .launcher
                .mutators
                .iter()
                .any(|m| matches!(m, MutatorConfig::FreePort { .. }))
        {
            config.launcher.mutators.push(MutatorConfig::FreePort {
                marker: gpufit_core::default_port_marker(),
                flag: gpufit_core::default_port_flag(),
            });
        }
    }
}

/// Load the config file, or defaults when none is given
pub fn load_config(path: Option<&Path>) -> Result<GpufitConfig> {
    match path {
        Some(path) => GpufitConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(GpufitConfig::default()),
    }
}

/// Jobs from the job file first, then the inline `--job` values
pub fn collect_jobs(jobs_file: Option<&Path>, inline: &[JobSpec]) -> Result<Vec<JobSpec>> {
    let mut jobs = match jobs_file {
        Some(path) => JobFile::from_file(path)
            .and_then(JobFile::into_specs)
            .with_context(|| format!("Failed to load jobs from {}", path.display()))?,
        None => Vec::new(),
    };
    jobs.extend(inline.iter().cloned());

    if jobs.is_empty() {
        anyhow::bail!("No jobs given; pass --jobs FILE or --job MB:COMMAND");
    }
    Ok(jobs)
}

fn telemetry(config: &GpufitConfig) -> Result<Arc<dyn TelemetryBackend>> {
    let launcher: Arc<dyn Launcher> = Arc::new(ProcessLauncher::new());
    Ok(backend_for(&config.telemetry, launcher)?)
}

/// Schedule every job; returns whether all of them finished successfully
pub async fn run(config: GpufitConfig, jobs: Vec<JobSpec>) -> Result<bool> {
    let launcher: Arc<dyn Launcher> = Arc::new(ProcessLauncher::new());
    let telemetry = backend_for(&config.telemetry, launcher.clone())?;
    let visibility_env = config.telemetry.visibility_env_var()?;

    let registry = ProcessRegistry::new();
    let _guard = LifecycleGuard::install(registry.clone())?;

    let scheduler = Scheduler::new(config.scheduler.clone(), telemetry, launcher, registry)
        .with_visibility_env(visibility_env)
        .with_mutators(build_mutators(&config.launcher.mutators))
        .with_stream_policies(
            StreamPolicy::from_capture(config.launcher.capture_stdout),
            StreamPolicy::from_capture(config.launcher.capture_stderr),
        );

    info!(jobs = jobs.len(), "Submitting jobs");
    let report = scheduler.run(jobs).await?;
    print_report(&report);

    Ok(report.is_success())
}

/// Show GPU information
pub async fn gpus(config: &GpufitConfig, json: bool) -> Result<()> {
    let snapshot = telemetry(config)?.capture().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!(
        "GPUs: {} visible, {} MB total capacity",
        snapshot.len(),
        total_capacity_mb(&snapshot)
    );
    if !snapshot.is_empty() {
        println!();
        println!("{:<6} {:>12} {:>12}", "INDEX", "FREE MB", "TOTAL MB");
        for gpu in &snapshot {
            println!(
                "{:<6} {:>12} {:>12}",
                gpu.index, gpu.free_memory_mb, gpu.total_memory_mb
            );
        }
    }

    Ok(())
}

/// One line of a dry-run plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanRow {
    pub job_index: usize,
    pub command: String,
    pub required_memory_mb: u64,
    /// `None` when the job would wait for memory to free up
    pub devices: Option<String>,
    pub score: Option<u64>,
}

/// Placement each job would get, in placement order, if it ran alone
/// against `snapshot`
pub fn plan_rows(jobs: &[JobSpec], snapshot: &[GpuSnapshot]) -> Vec<PlanRow> {
    placement_order(jobs)
        .into_iter()
        .map(|index| {
            let job = &jobs[index];
            let decision = WeightedPrefixStrategy.place(job, snapshot);
            PlanRow {
                job_index: index,
                command: job.command.clone(),
                required_memory_mb: job.required_memory_mb,
                devices: decision.as_ref().map(|d| d.devices.to_env_value()),
                score: decision.map(|d| d.score),
            }
        })
        .collect()
}

/// Print the placement plan without launching anything
pub async fn plan(config: &GpufitConfig, jobs: Vec<JobSpec>) -> Result<()> {
    let snapshot = telemetry(config)?.capture().await?;
    let capacity = total_capacity_mb(&snapshot);

    println!("{} job(s), {} GPU(s), {} MB total capacity", jobs.len(), snapshot.len(), capacity);
    println!();
    println!("{:<5} {:>10} {:<12} {:>10}  {}", "JOB", "MEMORY MB", "DEVICES", "SCORE", "COMMAND");

    for row in plan_rows(&jobs, &snapshot) {
        let devices = row.devices.unwrap_or_else(|| "waits".to_string());
        let score = row.score.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<5} {:>10} {:<12} {:>10}  {}",
            row.job_index, row.required_memory_mb, devices, score, row.command
        );
    }

    if let Some(largest) = jobs.iter().map(|j| j.required_memory_mb).max() {
        if largest >= capacity {
            println!();
            println!("Job needing {} MB can never fit in {} MB; a run would abort", largest, capacity);
        }
    }

    Ok(())
}

fn print_report(report: &RunReport) {
    println!("Run {} finished in {:.1}s", report.run_id, report.elapsed_secs);
    println!(
        "  Jobs: {} finished, {} failed, {} total",
        report.finished(),
        report.failed(),
        report.outcomes.len()
    );

    for outcome in report.outcomes.iter().filter(|o| o.phase != gpufit_core::JobPhase::Finished) {
        let code = outcome
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        println!("  [{}] {} ({}): {}", outcome.index, outcome.phase, code, outcome.command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Write;

    fn snapshot(devices: &[(u32, u64, u64)]) -> Vec<GpuSnapshot> {
        devices
            .iter()
            .map(|(index, free, total)| GpuSnapshot::new(*index, *free, *total, Utc::now()).unwrap())
            .collect()
    }

    #[test]
    fn test_collect_jobs_file_then_inline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[jobs]]
command = "python train.py --lr 0.1"
memory_mb = 4000

[[jobs]]
command = "python eval.py"
memory_mb = 1000
"#
        )
        .unwrap();

        let inline = vec!["500:echo hi".parse::<JobSpec>().unwrap()];
        let jobs = collect_jobs(Some(file.path()), &inline).unwrap();

        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].command, "python train.py --lr 0.1");
        assert_eq!(jobs[1].required_memory_mb, 1000);
        assert_eq!(jobs[2].command, "echo hi");
    }

    #[test]
    fn test_collect_jobs_requires_some_job() {
        assert!(collect_jobs(None, &[]).is_err());
    }

    #[test]
    fn test_collect_jobs_rejects_zero_memory() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[jobs]]\ncommand = \"true\"\nmemory_mb = 0").unwrap();
        assert!(collect_jobs(Some(file.path()), &[]).is_err());
    }

    #[test]
    fn test_load_config_defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.telemetry.mode, "nvidia");
        assert!(load_config(Some(Path::new("/nonexistent/gpufit.toml"))).is_err());
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = GpufitConfig::default();
        let overrides = RunOverrides {
            timeout_secs: Some(60),
            placement_delay_secs: Some(0),
            mode: Some("nvidia".to_string()),
            free_port: true,
            halt_on_failure: true,
        };
        overrides.apply(&mut config);
        overrides.apply(&mut config);

        assert_eq!(config.scheduler.timeout_secs, 60);
        assert_eq!(config.scheduler.placement_delay_secs, 0);
        assert_eq!(config.scheduler.failure_policy, FailurePolicy::Halt);
        assert_eq!(config.launcher.mutators.len(), 1);
    }

    #[test]
    fn test_empty_overrides_keep_config() {
        let mut config = GpufitConfig::default();
        RunOverrides::default().apply(&mut config);
        assert_eq!(config.scheduler.timeout_secs, gpufit_core::DEFAULT_TIMEOUT_SECS);
        assert!(config.launcher.mutators.is_empty());
    }

    #[test]
    fn test_plan_rows() {
        let snap = snapshot(&[(1, 6000, 8000), (0, 3000, 8000)]);
        let jobs = vec![
            JobSpec::new("small", 1000).unwrap(),
            JobSpec::new("large", 5900).unwrap(),
            JobSpec::new("huge", 7000).unwrap(),
        ];

        let rows = plan_rows(&jobs, &snap);
        let order: Vec<usize> = rows.iter().map(|r| r.job_index).collect();
        assert_eq!(order, vec![2, 1, 0]);

        assert_eq!(rows[0].devices, None);
        assert_eq!(rows[1].devices.as_deref(), Some("1"));
        assert_eq!(rows[1].score, Some(6000));
        assert_eq!(rows[2].devices.as_deref(), Some("1"));
    }
}
