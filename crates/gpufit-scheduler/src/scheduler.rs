//! Main scheduler logic
//!
//! A single control task alternates between polling launched jobs, placing at
//! most one pending job per iteration, and re-reading GPU telemetry. Memory
//! claimed by a placement is never subtracted locally; the next capture is
//! expected to show it, which is what the inter-placement delay is for.

use gpufit_core::{
    total_capacity_mb, DeviceMask, FailurePolicy, GpufitError, GpufitResult, GpuSnapshot, JobPhase,
    JobSpec, SchedulerConfig,
};
use gpufit_runtime::{
    CapturedOutput, CommandMutator, ExitOutcome, LaunchRequest, Launcher, ProcessHandle,
    ProcessRegistry, StreamPolicy,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::placement::{
    placement_order, weighted_prefix_scores, PlacementDecision, PlacementStrategy,
    WeightedPrefixStrategy,
};
use crate::telemetry::TelemetryBackend;

/// Per-job scheduling state
#[derive(Debug)]
pub struct JobState {
    /// Position in the submitted job list
    pub index: usize,
    pub spec: JobSpec,
    pub phase: JobPhase,
    /// Devices assigned at launch
    pub devices: Option<DeviceMask>,
    /// Spawn attempts, including failed ones
    pub launch_attempts: u32,
    pub exit: Option<ExitOutcome>,
    /// Captured output, kept for failed jobs
    pub output: Option<CapturedOutput>,
    handle: Option<ProcessHandle>,
}

impl JobState {
    fn new(index: usize, spec: JobSpec) -> Self {
        Self {
            index,
            spec,
            phase: JobPhase::Pending,
            devices: None,
            launch_attempts: 0,
            exit: None,
            output: None,
            handle: None,
        }
    }

    /// Whether the job has left `Pending`
    pub fn is_scheduled(&self) -> bool {
        self.phase != JobPhase::Pending
    }
}

/// One `Pending -> Running` transition
#[derive(Debug, Clone, Serialize)]
pub struct PlacementRecord {
    pub job_index: usize,
    pub required_memory_mb: u64,
    /// Command as launched, after mutators ran
    pub launched_command: String,
    pub devices: DeviceMask,
    pub prefix_len: usize,
    pub score: u64,
    /// Telemetry capture the decision was based on, counting from 1
    pub telemetry_cycle: u64,
}

/// Final state of one job
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub index: usize,
    pub command: String,
    pub required_memory_mb: u64,
    pub phase: JobPhase,
    pub devices: Option<DeviceMask>,
    pub exit_code: Option<i32>,
    pub launch_attempts: u32,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl From<JobState> for JobOutcome {
    fn from(state: JobState) -> Self {
        let (stdout, stderr) = match state.output {
            Some(output) => (Some(output.stdout), Some(output.stderr)),
            None => (None, None),
        };
        Self {
            index: state.index,
            command: state.spec.command,
            required_memory_mb: state.spec.required_memory_mb,
            phase: state.phase,
            devices: state.devices,
            exit_code: state.exit.and_then(|e| e.code),
            launch_attempts: state.launch_attempts,
            stdout,
            stderr,
        }
    }
}

/// Summary of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    /// In submission order
    pub outcomes: Vec<JobOutcome>,
    /// In placement order
    pub placements: Vec<PlacementRecord>,
    pub telemetry_captures: u64,
    pub elapsed_secs: f64,
}

impl RunReport {
    pub fn finished(&self) -> usize {
        self.count(JobPhase::Finished)
    }

    pub fn failed(&self) -> usize {
        self.count(JobPhase::Failed)
    }

    /// Every job finished with a zero exit code
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.phase == JobPhase::Finished)
    }

    fn count(&self, phase: JobPhase) -> usize {
        self.outcomes.iter().filter(|o| o.phase == phase).count()
    }
}

/// Mutable bookkeeping for one call to [`Scheduler::run`]
struct RunState {
    states: Vec<JobState>,
    placements: Vec<PlacementRecord>,
    /// Latest capture, most free first
    snapshot: Vec<GpuSnapshot>,
    /// Captures taken so far
    cycle: u64,
}

impl RunState {
    fn new(states: Vec<JobState>) -> Self {
        Self {
            states,
            placements: Vec::new(),
            snapshot: Vec::new(),
            cycle: 0,
        }
    }

    fn count(&self, phase: JobPhase) -> usize {
        self.states.iter().filter(|s| s.phase == phase).count()
    }
}

/// Scheduler places jobs on GPUs and tracks them until they exit
pub struct Scheduler {
    config: SchedulerConfig,
    telemetry: Arc<dyn TelemetryBackend>,
    launcher: Arc<dyn Launcher>,
    registry: ProcessRegistry,
    placement_strategy: Arc<dyn PlacementStrategy>,
    mutators: Vec<Arc<dyn CommandMutator>>,
    visibility_env: String,
    stdout: StreamPolicy,
    stderr: StreamPolicy,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        config: SchedulerConfig,
        telemetry: Arc<dyn TelemetryBackend>,
        launcher: Arc<dyn Launcher>,
        registry: ProcessRegistry,
    ) -> Self {
        let visibility_env = telemetry.mode().visibility_env_var().to_string();

        info!(
            mode = %telemetry.mode(),
            launcher = launcher.name(),
            timeout_secs = config.timeout_secs,
            placement_delay_secs = config.placement_delay_secs,
            "Scheduler initialized"
        );

        Self {
            config,
            telemetry,
            launcher,
            registry,
            placement_strategy: Arc::new(WeightedPrefixStrategy),
            mutators: Vec::new(),
            visibility_env,
            stdout: StreamPolicy::Capture,
            stderr: StreamPolicy::Capture,
        }
    }

    /// Rewrite every command with these mutators before launch
    pub fn with_mutators(mut self, mutators: Vec<Arc<dyn CommandMutator>>) -> Self {
        self.mutators = mutators;
        self
    }

    /// Use a different device-visibility variable than the backend's default
    pub fn with_visibility_env(mut self, var: impl Into<String>) -> Self {
        self.visibility_env = var.into();
        self
    }

    pub fn with_stream_policies(mut self, stdout: StreamPolicy, stderr: StreamPolicy) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn with_placement_strategy(mut self, strategy: Arc<dyn PlacementStrategy>) -> Self {
        self.placement_strategy = strategy;
        self
    }

    /// Registry holding every process this scheduler launched
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Run every job to a terminal state.
    ///
    /// Fails before launching anything when the largest job cannot fit the
    /// combined capacity of the visible devices. Jobs still running when the
    /// timeout expires are left alone.
    pub async fn run(&self, jobs: Vec<JobSpec>) -> GpufitResult<RunReport> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();

        let order = placement_order(&jobs);
        let states: Vec<JobState> = jobs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| JobState::new(index, spec))
            .collect();

        info!(run_id = %run_id, jobs = states.len(), "Starting scheduling run");

        let mut run = RunState::new(states);
        if let Some(&largest) = order.first() {
            run.snapshot = self.telemetry.capture().await?;
            run.cycle += 1;
            check_feasibility(&run.states[largest].spec, &run.snapshot)?;
            self.schedule_loop(run_id, started, &order, &mut run).await?;
        }

        let report = RunReport {
            run_id,
            outcomes: run.states.into_iter().map(JobOutcome::from).collect(),
            placements: run.placements,
            telemetry_captures: run.cycle,
            elapsed_secs: started.elapsed().as_secs_f64(),
        };

        info!(
            run_id = %run_id,
            finished = report.finished(),
            failed = report.failed(),
            elapsed_secs = report.elapsed_secs,
            "Scheduling run complete"
        );

        Ok(report)
    }

    async fn schedule_loop(
        &self,
        run_id: Uuid,
        started: Instant,
        order: &[usize],
        run: &mut RunState,
    ) -> GpufitResult<()> {
        loop {
            self.poll_running(&mut run.states).await?;

            if run.states.iter().all(|s| s.phase.is_terminal()) {
                return Ok(());
            }

            if started.elapsed() >= self.config.timeout() {
                let pending = run.count(JobPhase::Pending);
                let running = run.count(JobPhase::Running);
                warn!(run_id = %run_id, pending, running, "Scheduling timed out");
                return Err(GpufitError::SchedulingTimeout {
                    timeout_secs: self.config.timeout_secs,
                    pending,
                    running,
                });
            }

            let pending: Vec<usize> = order
                .iter()
                .copied()
                .filter(|i| run.states[*i].phase == JobPhase::Pending)
                .collect();

            if pending.is_empty() {
                tokio::time::sleep(self.config.poll_interval()).await;
                continue;
            }

            debug!(
                run_id = %run_id,
                cycle = run.cycle,
                scores = ?weighted_prefix_scores(&run.snapshot),
                pending = pending.len(),
                "Placement pass"
            );

            let placed = self.placement_pass(run_id, &pending, run).await?;

            if placed {
                debug!(delay_secs = self.config.placement_delay_secs, "Waiting for telemetry to settle");
                tokio::time::sleep(self.config.placement_delay()).await;
            } else {
                tokio::time::sleep(self.config.poll_interval()).await;
            }

            run.snapshot = self.telemetry.capture().await?;
            run.cycle += 1;
        }
    }

    /// Start the first pending job that fits the current snapshot.
    ///
    /// Returns whether a job was launched.
    async fn placement_pass(&self, run_id: Uuid, pending: &[usize], run: &mut RunState) -> GpufitResult<bool> {
        for &index in pending {
            let Some(decision) = self.placement_strategy.place(&run.states[index].spec, &run.snapshot) else {
                continue;
            };

            let state = &mut run.states[index];
            match self.start_job(state, &decision).await {
                Ok(launched_command) => {
                    run.placements.push(PlacementRecord {
                        job_index: index,
                        required_memory_mb: state.spec.required_memory_mb,
                        launched_command,
                        devices: decision.devices,
                        prefix_len: decision.prefix_len,
                        score: decision.score,
                        telemetry_cycle: run.cycle,
                    });
                    return Ok(true);
                }
                Err(e @ GpufitError::Mutator(_)) => {
                    // Rewriting the same command again would fail the same way
                    error!(run_id = %run_id, job = index, error = %e, "Command rewrite failed, job not started");
                    state.phase = JobPhase::Failed;
                    state.output = Some(CapturedOutput {
                        stdout: String::new(),
                        stderr: e.to_string(),
                    });
                    if self.config.failure_policy == FailurePolicy::Halt {
                        return Err(e);
                    }
                }
                Err(e) => {
                    warn!(
                        run_id = %run_id,
                        job = index,
                        attempts = state.launch_attempts,
                        error = %e,
                        "Launch failed, job stays pending"
                    );
                }
            }
        }

        Ok(false)
    }

    /// Launch a job on its assigned devices; the registry tracks it from spawn
    async fn start_job(&self, state: &mut JobState, decision: &PlacementDecision) -> GpufitResult<String> {
        state.launch_attempts += 1;

        let request = LaunchRequest::new(state.spec.command.clone())
            .env(self.visibility_env.clone(), decision.devices.to_env_value())
            .stdout(self.stdout)
            .stderr(self.stderr)
            .mutators(self.mutators.clone());

        let handle = self
            .registry
            .launch_tracked(self.launcher.as_ref(), request)
            .await?;

        info!(
            job = state.index,
            command = %handle.command(),
            required_mb = state.spec.required_memory_mb,
            devices = %decision.devices,
            score = decision.score,
            "Scheduled job into {}={}",
            self.visibility_env,
            decision.devices
        );

        let launched_command = handle.command().to_string();
        state.phase = JobPhase::Running;
        state.devices = Some(decision.devices.clone());
        state.handle = Some(handle);
        Ok(launched_command)
    }

    /// Move exited jobs to a terminal phase, surfacing failures
    async fn poll_running(&self, states: &mut [JobState]) -> GpufitResult<()> {
        for state in states.iter_mut().filter(|s| s.phase == JobPhase::Running) {
            let Some(handle) = state.handle.as_mut() else {
                continue;
            };
            let Some(outcome) = handle.try_exit().await? else {
                continue;
            };

            state.exit = Some(outcome);

            if outcome.success {
                info!(job = state.index, command = %state.spec.command, "Job finished");
                state.phase = JobPhase::Finished;
                state.handle = None;
                continue;
            }

            let output = handle.collect_output().await;
            error!(
                job = state.index,
                command = %state.spec.command,
                exit_code = ?outcome.code,
                stdout = %output.stdout,
                stderr = %output.stderr,
                "Job failed"
            );
            state.phase = JobPhase::Failed;
            state.handle = None;

            if self.config.failure_policy == FailurePolicy::Halt {
                return Err(GpufitError::JobRuntimeFailure {
                    command: state.spec.command.clone(),
                    exit_code: outcome.code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                });
            }
            state.output = Some(output);
        }

        Ok(())
    }
}

/// The largest job must be strictly smaller than the summed total memory
fn check_feasibility(largest: &JobSpec, snapshot: &[GpuSnapshot]) -> GpufitResult<()> {
    let capacity_mb = total_capacity_mb(snapshot);
    if largest.required_memory_mb >= capacity_mb {
        error!(
            command = %largest.command,
            required_mb = largest.required_memory_mb,
            capacity_mb,
            devices = snapshot.len(),
            "Job can't be scheduled onto the visible GPUs"
        );
        return Err(GpufitError::InfeasibleJob {
            command: largest.command.clone(),
            required_mb: largest.required_memory_mb,
            capacity_mb,
        });
    }
    Ok(())
}
