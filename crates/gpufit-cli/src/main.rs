//! gpufit CLI
//!
//! Runs a batch of GPU jobs on this host, placing each one on the devices
//! with the most free memory.

mod commands;

use clap::{Parser, Subcommand};
use gpufit_core::{GpufitConfig, JobSpec};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// gpufit - greedy GPU-memory-aware batch job scheduler
#[derive(Parser, Debug)]
#[command(name = "gpufit")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (text or json), overrides the config file
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Schedule jobs and wait for all of them to exit
    Run {
        /// Job file (TOML)
        #[arg(long)]
        jobs: Option<PathBuf>,

        /// Inline job as MB:COMMAND, may be repeated
        #[arg(long = "job")]
        job: Vec<JobSpec>,

        /// Give up on pending jobs after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Seconds to wait after each placement before re-reading telemetry
        #[arg(long)]
        placement_delay_secs: Option<u64>,

        /// Telemetry backend
        #[arg(long)]
        mode: Option<String>,

        /// Inject a free --master_port into torch.distributed.launch commands
        #[arg(long)]
        free_port: bool,

        /// Stop at the first job failure
        #[arg(long)]
        halt_on_failure: bool,
    },

    /// Show GPU memory as the scheduler sees it
    Gpus {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show where each job would be placed, without launching anything
    Plan {
        /// Job file (TOML)
        #[arg(long)]
        jobs: Option<PathBuf>,

        /// Inline job as MB:COMMAND, may be repeated
        #[arg(long = "job")]
        job: Vec<JobSpec>,
    },
}

fn init_logging(config: &GpufitConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // Logs go to stderr so stdout stays machine-readable
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if config.logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = commands::load_config(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if let Err(e) = init_logging(&config) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match cli.command {
        Commands::Run {
            jobs,
            job,
            timeout_secs,
            placement_delay_secs,
            mode,
            free_port,
            halt_on_failure,
        } => {
            let overrides = commands::RunOverrides {
                timeout_secs,
                placement_delay_secs,
                mode,
                free_port,
                halt_on_failure,
            };
            overrides.apply(&mut config);

            let jobs = commands::collect_jobs(jobs.as_deref(), &job)?;
            if !commands::run(config, jobs).await? {
                std::process::exit(1);
            }
        }
        Commands::Gpus { json } => {
            commands::gpus(&config, json).await?;
        }
        Commands::Plan { jobs, job } => {
            let jobs = commands::collect_jobs(jobs.as_deref(), &job)?;
            commands::plan(&config, jobs).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_logging_init_reports_error() {
        let config = GpufitConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_err());
    }
}
