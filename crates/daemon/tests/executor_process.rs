// End-to-end tests against the real `qvisor` binary

#![cfg(unix)]

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use qvisor_core::application::{ProcessHandle, QemuDriver};
use qvisor_core::domain::protocol::MAGIC_COOKIE_KEY;
use qvisor_core::domain::{ExecCommand, ExecutorContext, HandleIdentity};
use qvisor_core::port::artifact::mocks::MockArtifactFetcher;
use qvisor_core::port::{ExecutorClient, ExecutorError};
use qvisor_infra_system::process::is_alive;
use qvisor_infra_system::RpcExecutorClient;

const QVISOR: &str = env!("CARGO_BIN_EXE_qvisor");

fn sleep_cmd(secs: u32) -> ExecCommand {
    ExecCommand {
        cmd: "sleep".to_string(),
        args: vec![secs.to_string()],
    }
}

fn shell_cmd(script: &str) -> ExecCommand {
    ExecCommand {
        cmd: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
    }
}

/// Wait for the supervisor's teardown to kill and reap an executor
async fn assert_executor_gone(pid: u32) {
    for _ in 0..100 {
        if !is_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("executor {pid} still running");
}

#[tokio::test]
async fn test_executor_stops_process_gracefully() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ExecutorContext::new("sleeper", dir.path().join("sleeper"));
    let client = RpcExecutorClient::new(QVISOR);

    let conn = client.spawn(&ctx).await.unwrap();
    let launched = conn.launch_cmd(&sleep_cmd(30), &ctx).await.unwrap();
    assert!(launched.pid > 0);

    conn.shutdown().await.unwrap();
    let state = tokio::time::timeout(Duration::from_secs(10), conn.wait())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(state.pid, launched.pid);
    assert_eq!(state.signal, 15);
    assert_eq!(state.exit_code, 128 + 15);

    conn.teardown().await;
    assert!(ctx.executor_log_path().exists());
}

#[tokio::test]
async fn test_reattach_to_live_executor_then_gone_after_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ExecutorContext::new("sleeper", dir.path().join("sleeper"));
    let client = RpcExecutorClient::new(QVISOR);

    let original = client.spawn(&ctx).await.unwrap();
    original.launch_cmd(&sleep_cmd(30), &ctx).await.unwrap();
    let descriptor = original.reattach_descriptor();

    let reattached = client.reattach(&descriptor).await.unwrap();
    assert_eq!(reattached.reattach_descriptor(), descriptor);

    reattached.exit().await.unwrap();
    let state = reattached.wait().await.unwrap();
    assert_eq!(state.signal, 9);

    original.teardown().await;
    let err = client.reattach(&descriptor).await.err().unwrap();
    assert!(matches!(err, ExecutorError::ExecutorGone(_)));
}

#[test]
fn test_executor_refuses_to_run_without_cookie() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(QVISOR)
        .arg("executor")
        .arg("--log-file")
        .arg(dir.path().join("executor.log"))
        .env_remove(MAGIC_COOKIE_KEY)
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn test_list_on_fresh_store() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(QVISOR)
        .arg("list")
        .arg("--db-path")
        .arg(dir.path().join("state.db"))
        .arg("--state-dir")
        .arg(dir.path().join("tasks"))
        .output()
        .unwrap();

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("No tasks recorded"));
    assert!(dir.path().join("state.db").exists());
}

#[tokio::test]
async fn test_handle_identity_reopens_same_executor() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ExecutorContext::new("sleeper", dir.path().join("sleeper"));
    let client = Arc::new(RpcExecutorClient::new(QVISOR));

    let launched = client.launch(&sleep_cmd(30), &ctx).await.unwrap();
    let descriptor = launched.connection.reattach_descriptor();
    let identity = HandleIdentity {
        kill_timeout: Duration::from_secs(5),
        user_pid: launched.pid,
        reattach: descriptor.clone(),
    }
    .encode()
    .unwrap();

    // A fresh agent rebuilds the handle from its identity alone
    let driver = QemuDriver::new(client.clone(), Arc::new(MockArtifactFetcher::new()));
    let handle = driver.open("sleeper", &identity).await.unwrap();
    assert_eq!(handle.user_pid(), launched.pid);
    assert_eq!(handle.kill_timeout(), Duration::from_secs(5));
    assert_eq!(handle.identity().unwrap(), identity);

    // sleep honours SIGTERM, so no forced exit is needed
    handle.kill().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.signal, 15);
    assert_eq!(result.exit_code, 143);
    assert!(result.error.is_none());
    assert!(handle.wait().await.is_none());

    // The reopened handle's supervisor stops the executor it verified
    let mut stopped = false;
    for _ in 0..100 {
        if client.reattach(&descriptor).await.is_err() {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(stopped, "executor still answering after supervision ended");

    launched.connection.teardown().await;
    assert_executor_gone(descriptor.pid).await;
}

#[tokio::test]
async fn test_kill_forces_exit_when_sigterm_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ExecutorContext::new("stubborn", dir.path().join("stubborn"));
    let client = RpcExecutorClient::new(QVISOR);

    let launched = client
        .launch(&shell_cmd("trap '' TERM; sleep 30"), &ctx)
        .await
        .unwrap();
    let executor_pid = launched.connection.reattach_descriptor().pid;
    let handle = ProcessHandle::supervise(
        "stubborn",
        launched.connection,
        launched.pid,
        Duration::from_millis(500),
    );

    // Let the shell install its trap before the graceful request
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.kill().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.signal, 9);
    assert_eq!(result.exit_code, 128 + 9);
    assert!(handle.wait().await.is_none());

    assert_executor_gone(executor_pid).await;
}
