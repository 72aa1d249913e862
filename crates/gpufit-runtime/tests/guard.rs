//! Signal teardown runs in its own test binary: the guard takes over SIGTERM
//! for the whole process.

#![cfg(unix)]

use gpufit_runtime::{LaunchRequest, Launcher, LifecycleGuard, ProcessHandle, ProcessLauncher, ProcessRegistry};
use std::time::Duration;

async fn wait_for_exit(handle: &ProcessHandle) -> bool {
    loop {
        if let Some(outcome) = handle.try_exit().await.unwrap() {
            return outcome.success;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn sigterm_kills_every_tracked_job_once() {
    let launcher = ProcessLauncher::new();
    let registry = ProcessRegistry::new();

    let first = launcher.launch(LaunchRequest::new("sleep 30")).await.unwrap();
    let second = launcher.launch(LaunchRequest::new("sleep 30")).await.unwrap();
    let finished = launcher.launch(LaunchRequest::new("true")).await.unwrap();
    for handle in [&first, &second, &finished] {
        registry.track(handle).await;
    }
    assert!(wait_for_exit(&finished).await);

    let guard = LifecycleGuard::install_without_exit(registry.clone()).unwrap();

    let status = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(std::process::id().to_string())
        .status()
        .unwrap();
    assert!(status.success());

    let report = tokio::time::timeout(Duration::from_secs(10), guard.wait())
        .await
        .expect("guard did not react to SIGTERM")
        .unwrap();

    assert_eq!(report.killed, 2);
    assert_eq!(report.already_exited, 1);
    assert_eq!(report.failed, 0);
    assert!(registry.is_empty().await);

    assert!(!wait_for_exit(&first).await);
    assert!(!wait_for_exit(&second).await);
}
