//! Process-based launcher implementation
//!
//! Jobs run as direct OS child processes. The synchronous mode is used for
//! one-shot queries such as GPU telemetry, the asynchronous mode for jobs.

use async_trait::async_trait;
use gpufit_core::{GpufitError, GpufitResult};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::registry::TrackedProcess;
use crate::traits::{CommandMutator, Launcher};

/// Upper bound on waiting for an exited job's output pipes to close
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bytes kept from the end of each captured job stream
pub const OUTPUT_TAIL_BYTES: usize = 64 * 1024;

/// What to do with a child's output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPolicy {
    /// Pipe the stream back to the scheduler
    #[default]
    Capture,
    /// Send the stream to /dev/null
    Discard,
}

impl StreamPolicy {
    pub fn from_capture(capture: bool) -> Self {
        if capture {
            StreamPolicy::Capture
        } else {
            StreamPolicy::Discard
        }
    }

    fn stdio(&self) -> Stdio {
        match self {
            StreamPolicy::Capture => Stdio::piped(),
            StreamPolicy::Discard => Stdio::null(),
        }
    }
}

/// A command to start, with its environment overrides and stream policies
#[derive(Clone)]
pub struct LaunchRequest {
    /// Command line before mutation
    pub command: String,
    /// Variables set on top of the inherited environment
    pub env: Vec<(String, String)>,
    pub stdout: StreamPolicy,
    pub stderr: StreamPolicy,
    /// Applied left to right before tokenization
    pub mutators: Vec<Arc<dyn CommandMutator>>,
}

impl LaunchRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: Vec::new(),
            stdout: StreamPolicy::Capture,
            stderr: StreamPolicy::Capture,
            mutators: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdout(mut self, policy: StreamPolicy) -> Self {
        self.stdout = policy;
        self
    }

    pub fn stderr(mut self, policy: StreamPolicy) -> Self {
        self.stderr = policy;
        self
    }

    pub fn mutators(mut self, mutators: Vec<Arc<dyn CommandMutator>>) -> Self {
        self.mutators = mutators;
        self
    }

    /// Run every mutator over the command in order
    pub fn resolved_command(&self) -> GpufitResult<String> {
        let mut command = self.command.clone();
        for mutator in &self.mutators {
            command = mutator.mutate(&command)?;
        }
        Ok(command)
    }
}

impl std::fmt::Debug for LaunchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchRequest")
            .field("command", &self.command)
            .field("env", &self.env)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("mutators", &self.mutators.len())
            .finish()
    }
}

/// Split a command on whitespace. Quoting is not understood.
pub fn tokenize(command: &str) -> GpufitResult<Vec<String>> {
    let args: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    if args.is_empty() {
        return Err(GpufitError::LaunchFailure("command is empty".to_string()));
    }
    Ok(args)
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    pub success: bool,
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

/// Result of a synchronous run
#[derive(Debug, Clone)]
pub struct CompletedProcess {
    /// Command as actually executed, after mutation
    pub command: String,
    pub outcome: ExitOutcome,
    pub stdout: String,
    pub stderr: String,
}

impl CompletedProcess {
    pub fn success(&self) -> bool {
        self.outcome.success
    }
}

/// Output collected from an asynchronous child
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Handle to a running child process
pub struct ProcessHandle {
    id: Uuid,
    command: String,
    pid: Option<u32>,
    child: Arc<Mutex<Child>>,
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
}

impl ProcessHandle {
    fn new(command: String, mut child: Child) -> Self {
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        Self {
            id: Uuid::new_v4(),
            command,
            pid: child.id(),
            child: Arc::new(Mutex::new(child)),
            stdout,
            stderr,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Command as actually executed, after mutation
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Non-blocking status poll; `None` while the process is still running
    pub async fn try_exit(&self) -> GpufitResult<Option<ExitOutcome>> {
        let mut child = self.child.lock().await;
        Ok(child.try_wait()?.map(ExitOutcome::from))
    }

    /// Send SIGKILL (or the platform equivalent) without waiting
    pub async fn kill(&self) -> GpufitResult<()> {
        let mut child = self.child.lock().await;
        child.start_kill()?;
        Ok(())
    }

    /// Collect whatever the child wrote to its captured streams.
    ///
    /// Meant for exited processes; each stream is only returned once.
    pub async fn collect_output(&mut self) -> CapturedOutput {
        CapturedOutput {
            stdout: join_output(self.stdout.take(), self.id).await,
            stderr: join_output(self.stderr.take(), self.id).await,
        }
    }

    pub(crate) fn tracked(&self) -> TrackedProcess {
        TrackedProcess::new(self.id, self.pid, self.command.clone(), self.child.clone())
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("command", &self.command)
            .finish()
    }
}

/// Read a stream to its end, keeping only the last [`OUTPUT_TAIL_BYTES`]
fn drain<R>(mut reader: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut tail: Vec<u8> = Vec::with_capacity(OUTPUT_TAIL_BYTES);
        let mut chunk = vec![0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    tail.extend_from_slice(&chunk[..n]);
                    // Trim in batches so the copy is amortized
                    if tail.len() >= 2 * OUTPUT_TAIL_BYTES {
                        tail.drain(..tail.len() - OUTPUT_TAIL_BYTES);
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Stopped reading child output");
                    break;
                }
            }
        }
        if tail.len() > OUTPUT_TAIL_BYTES {
            tail.drain(..tail.len() - OUTPUT_TAIL_BYTES);
        }
        String::from_utf8_lossy(&tail).into_owned()
    })
}

async fn join_output(reader: Option<JoinHandle<String>>, id: Uuid) -> String {
    let Some(reader) = reader else {
        return String::new();
    };

    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!(process_id = %id, error = %e, "Output reader task failed");
            String::new()
        }
        Err(_) => {
            // A grandchild may still hold the pipe open
            warn!(process_id = %id, "Timed out collecting process output");
            String::new()
        }
    }
}

/// Process-based launcher
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    /// Create a new process launcher
    pub fn new() -> Self {
        Self
    }

    /// Mutate, tokenize and configure the command for a request.
    ///
    /// Mutator errors are returned as they are so callers can tell them
    /// apart from spawn failures.
    fn build_command(&self, request: &LaunchRequest) -> GpufitResult<(String, Command)> {
        let command = request.resolved_command()?;
        let args = tokenize(&command)?;

        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..]);
        cmd.envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        // Configure process I/O
        cmd.stdin(Stdio::null());
        cmd.stdout(request.stdout.stdio());
        cmd.stderr(request.stderr.stdio());

        Ok((command, cmd))
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, request: LaunchRequest) -> GpufitResult<ProcessHandle> {
        let (command, mut cmd) = self.build_command(&request)?;

        match cmd.spawn() {
            Ok(child) => {
                let handle = ProcessHandle::new(command, child);
                info!(
                    process_id = %handle.id(),
                    pid = ?handle.pid(),
                    command = %handle.command(),
                    "Process spawned"
                );
                Ok(handle)
            }
            Err(e) => {
                error!(command = %command, error = %e, "Failed to spawn process");
                Err(GpufitError::LaunchFailure(format!(
                    "Failed to spawn '{}': {}",
                    command, e
                )))
            }
        }
    }

    async fn run(&self, request: LaunchRequest) -> GpufitResult<CompletedProcess> {
        let (command, mut cmd) = self.build_command(&request)?;
        debug!(command = %command, "Running command to completion");

        // `Command::output` would force both streams to pipes
        let output = match cmd.spawn() {
            Ok(child) => child.wait_with_output().await,
            Err(e) => Err(e),
        }
        .map_err(|e| {
            error!(command = %command, error = %e, "Failed to run command");
            GpufitError::LaunchFailure(format!("Failed to run '{}': {}", command, e))
        })?;

        Ok(CompletedProcess {
            command,
            outcome: output.status.into(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn wait_for_exit(handle: &ProcessHandle) -> ExitOutcome {
        loop {
            if let Some(outcome) = handle.try_exit().await.unwrap() {
                return outcome;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("python  train.py --lr 0.1").unwrap(),
            vec!["python", "train.py", "--lr", "0.1"]
        );
        assert!(matches!(tokenize("   "), Err(GpufitError::LaunchFailure(_))));
    }

    #[test]
    fn test_tokenize_does_not_understand_quotes() {
        assert_eq!(
            tokenize("echo \"a b\"").unwrap(),
            vec!["echo", "\"a", "b\""]
        );
    }

    #[test]
    fn test_resolved_command_applies_mutators_in_order() {
        let first: Arc<dyn CommandMutator> = Arc::new(|c: &str| format!("{} --a", c));
        let second: Arc<dyn CommandMutator> = Arc::new(|c: &str| format!("{} --b", c));
        let request = LaunchRequest::new("train").mutators(vec![first, second]);
        assert_eq!(request.resolved_command().unwrap(), "train --a --b");
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let launcher = ProcessLauncher::new();
        let done = launcher.run(LaunchRequest::new("echo hello gpu")).await.unwrap();
        assert!(done.success());
        assert_eq!(done.stdout.trim(), "hello gpu");
        assert_eq!(done.outcome.code, Some(0));
    }

    #[tokio::test]
    async fn test_run_discards_output() {
        let launcher = ProcessLauncher::new();
        let request = LaunchRequest::new("echo hidden").stdout(StreamPolicy::Discard);
        let done = launcher.run(request).await.unwrap();
        assert!(done.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_run_sets_env_override() {
        let launcher = ProcessLauncher::new();
        let request = LaunchRequest::new("printenv CUDA_VISIBLE_DEVICES").env("CUDA_VISIBLE_DEVICES", "1,3");
        let done = launcher.run(request).await.unwrap();
        assert_eq!(done.stdout.trim(), "1,3");
    }

    #[tokio::test]
    async fn test_run_inherits_environment() {
        let launcher = ProcessLauncher::new();
        let request = LaunchRequest::new("printenv PATH").env("CUDA_VISIBLE_DEVICES", "0");
        let done = launcher.run(request).await.unwrap();
        assert!(done.success());
        assert!(!done.stdout.trim().is_empty());
    }

    #[tokio::test]
    async fn test_launch_missing_binary() {
        let launcher = ProcessLauncher::new();
        let err = launcher
            .launch(LaunchRequest::new("/nonexistent/gpufit-test-binary --flag"))
            .await
            .unwrap_err();
        assert!(matches!(err, GpufitError::LaunchFailure(_)));
    }

    #[tokio::test]
    async fn test_launch_mutator_error_is_not_launch_failure() {
        struct Refuse;
        impl CommandMutator for Refuse {
            fn mutate(&self, _command: &str) -> GpufitResult<String> {
                Err(GpufitError::Mutator("no".to_string()))
            }
        }

        let launcher = ProcessLauncher::new();
        let refuse: Arc<dyn CommandMutator> = Arc::new(Refuse);
        let request = LaunchRequest::new("true").mutators(vec![refuse]);
        let err = launcher.launch(request).await.unwrap_err();
        assert!(matches!(err, GpufitError::Mutator(_)));
    }

    #[tokio::test]
    async fn test_launch_poll_and_collect_failure_output() {
        let launcher = ProcessLauncher::new();
        let mut handle = launcher
            .launch(LaunchRequest::new("ls /nonexistent-gpufit-path"))
            .await
            .unwrap();

        let outcome = wait_for_exit(&handle).await;
        assert!(!outcome.success);

        let output = handle.collect_output().await;
        assert!(!output.stderr.is_empty());

        // Streams are handed out once
        assert_eq!(handle.collect_output().await, CapturedOutput::default());
    }

    #[tokio::test]
    async fn test_run_discards_stderr_only() {
        let launcher = ProcessLauncher::new();
        let request = LaunchRequest::new("ls /nonexistent-gpufit-path").stderr(StreamPolicy::Discard);
        let done = launcher.run(request).await.unwrap();
        assert!(!done.success());
        assert!(done.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_collected_output_keeps_bounded_tail() {
        let launcher = ProcessLauncher::new();
        let mut handle = launcher
            .launch(LaunchRequest::new("head -c 1000000 /dev/zero"))
            .await
            .unwrap();

        assert!(wait_for_exit(&handle).await.success);
        let output = handle.collect_output().await;
        assert_eq!(output.stdout.len(), OUTPUT_TAIL_BYTES);
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_short_output_is_kept_whole() {
        let launcher = ProcessLauncher::new();
        let mut handle = launcher.launch(LaunchRequest::new("echo short")).await.unwrap();
        wait_for_exit(&handle).await;
        assert_eq!(handle.collect_output().await.stdout, "short\n");
    }

    #[tokio::test]
    async fn test_kill_running_process() {
        let launcher = ProcessLauncher::new();
        let handle = launcher.launch(LaunchRequest::new("sleep 30")).await.unwrap();
        assert!(handle.pid().is_some());
        assert!(handle.try_exit().await.unwrap().is_none());

        handle.kill().await.unwrap();
        let outcome = wait_for_exit(&handle).await;
        assert!(!outcome.success);
        assert_eq!(outcome.code, None);
    }
}
