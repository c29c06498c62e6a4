// Executor client: spawns `qvisor executor` subprocesses and reconnects to them

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use qvisor_core::domain::protocol::{HandshakeLine, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE};
use qvisor_core::domain::{ExecutorContext, ReattachDescriptor};
use qvisor_core::port::{ExecutorClient, ExecutorConnection, ExecutorError};

use crate::process;
use crate::rpc_connection::{RpcExecutorConnection, DEFAULT_REQUEST_TIMEOUT};

/// Subcommand the executor binary runs under
pub const EXECUTOR_SUBCOMMAND: &str = "executor";

/// How long a new executor gets to print its handshake line
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RpcExecutorClient {
    executor_bin: PathBuf,
    startup_timeout: Duration,
    request_timeout: Duration,
}

impl RpcExecutorClient {
    /// Create a client that launches executors from `executor_bin`
    ///
    /// # Example
    /// ```ignore
    /// let client = RpcExecutorClient::new(std::env::current_exe()?);
    /// ```
    pub fn new(executor_bin: impl Into<PathBuf>) -> Self {
        Self {
            executor_bin: executor_bin.into(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn command(&self, ctx: &ExecutorContext) -> Command {
        let mut cmd = Command::new(&self.executor_bin);
        cmd.arg(EXECUTOR_SUBCOMMAND)
            .arg("--log-file")
            .arg(ctx.executor_log_path())
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        // Own process group: terminal signals to the agent must not reach the VM
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }

    /// Read the handshake line the executor prints once it is listening
    async fn read_handshake(&self, child: &mut Child) -> Result<HandshakeLine, ExecutorError> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::Handshake("executor stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let line = tokio::time::timeout(self.startup_timeout, lines.next_line())
            .await
            .map_err(|_| {
                ExecutorError::Handshake(format!(
                    "no handshake within {}ms",
                    self.startup_timeout.as_millis()
                ))
            })?
            .map_err(|e| ExecutorError::Handshake(format!("failed to read handshake: {}", e)))?
            .ok_or_else(|| {
                ExecutorError::Handshake("executor exited before handshake".to_string())
            })?;

        HandshakeLine::parse(&line).map_err(ExecutorError::Handshake)
    }

    async fn abandon(child: &mut Child) {
        if let Err(e) = child.kill().await {
            warn!(error = %e, "Failed to kill executor after failed start");
        }
    }
}

#[async_trait]
impl ExecutorClient for RpcExecutorClient {
    async fn spawn(
        &self,
        context: &ExecutorContext,
    ) -> Result<Arc<dyn ExecutorConnection>, ExecutorError> {
        tokio::fs::create_dir_all(&context.task_dir)
            .await
            .map_err(|e| {
                ExecutorError::SpawnFailed(format!(
                    "cannot create task dir {}: {}",
                    context.task_dir.display(),
                    e
                ))
            })?;

        let mut child = self
            .command(context)
            .spawn()
            .map_err(|e| ExecutorError::SpawnFailed(e.to_string()))?;
        let executor_pid = child
            .id()
            .ok_or_else(|| ExecutorError::SpawnFailed("executor exited immediately".to_string()))?;

        let handshake = match self.read_handshake(&mut child).await {
            Ok(hs) => hs,
            Err(e) => {
                Self::abandon(&mut child).await;
                return Err(e);
            }
        };

        debug!(
            task = %context.task_name,
            executor_pid = %executor_pid,
            addr = %handshake.addr,
            "Executor listening"
        );

        let descriptor =
            ReattachDescriptor::new(handshake.addr, executor_pid, handshake.instance_id);
        // Until the connection owns the child, a failure here must kill it
        let connection = match RpcExecutorConnection::connect(descriptor, self.request_timeout).await
        {
            Ok(connection) => connection.with_child(child),
            Err(e) => {
                Self::abandon(&mut child).await;
                return Err(e);
            }
        };

        info!(
            task = %context.task_name,
            executor_pid = %executor_pid,
            log_file = %context.executor_log_path().display(),
            "Started executor"
        );
        Ok(Arc::new(connection))
    }

    async fn reattach(
        &self,
        descriptor: &ReattachDescriptor,
    ) -> Result<Arc<dyn ExecutorConnection>, ExecutorError> {
        descriptor
            .validate()
            .map_err(ExecutorError::InvalidDescriptor)?;

        if !process::is_alive(descriptor.pid) {
            return Err(ExecutorError::ExecutorGone(descriptor.pid));
        }

        let connection =
            RpcExecutorConnection::connect(descriptor.clone(), self.request_timeout).await?;
        Ok(Arc::new(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(dir: &std::path::Path) -> ExecutorContext {
        ExecutorContext::new("vm", dir.join("vm"))
    }

    #[tokio::test]
    async fn test_reattach_rejects_malformed_descriptor() {
        let client = RpcExecutorClient::new("/nonexistent/qvisor");
        let mut descriptor =
            ReattachDescriptor::new("127.0.0.1:1".parse().unwrap(), 12, "abc");
        descriptor.network = "unix".to_string();

        let err = client.reattach(&descriptor).await.err().unwrap();
        assert!(matches!(err, ExecutorError::InvalidDescriptor(_)));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let client = RpcExecutorClient::new(dir.path().join("no-such-binary"));

        let err = client.spawn(&ctx(dir.path())).await.err().unwrap();
        assert!(matches!(err, ExecutorError::SpawnFailed(_)));
    }

    /// Write an executable shell script standing in for the executor binary
    #[cfg(unix)]
    fn fake_executor(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join(name);
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_without_handshake_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_executor(dir.path(), "silent-executor", "sleep 30");

        let client =
            RpcExecutorClient::new(&script).with_startup_timeout(Duration::from_millis(200));
        let err = client.spawn(&ctx(dir.path())).await.err().unwrap();
        assert!(matches!(err, ExecutorError::Handshake(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_rejects_garbage_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_executor(dir.path(), "chatty-executor", "echo hello world\nsleep 30");

        let client = RpcExecutorClient::new(&script);
        let err = client.spawn(&ctx(dir.path())).await.err().unwrap();
        assert!(matches!(err, ExecutorError::Handshake(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_kills_executor_that_cannot_be_reached() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("executor.pid");
        // Announces an address nobody listens on, then stays alive
        let body = format!(
            "echo $$ > {}\necho '1|tcp|127.0.0.1:1|abc'\nexec sleep 30",
            pid_file.display()
        );
        let script = fake_executor(dir.path(), "unreachable-executor", &body);

        let client = RpcExecutorClient::new(&script).with_request_timeout(Duration::from_secs(2));
        let err = client.spawn(&ctx(dir.path())).await.err().unwrap();
        assert!(matches!(err, ExecutorError::Unreachable { .. }), "{err:?}");

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!process::is_alive(pid));
    }
}
