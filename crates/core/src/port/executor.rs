// Executor Port
// Abstraction over an out-of-process executor that owns one OS process

use crate::domain::{ExecCommand, ExecutorContext, ProcessState, ReattachDescriptor};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Executor errors
#[derive(Error, Debug, Clone)]
pub enum ExecutorError {
    #[error("Failed to spawn executor: {0}")]
    SpawnFailed(String),

    #[error("Executor handshake failed: {0}")]
    Handshake(String),

    #[error("Executor does not support the expected interface (want {expected}): {found}")]
    UnsupportedProtocol { expected: String, found: String },

    #[error("Executor failed to start process: {0}")]
    LaunchFailed(String),

    #[error("Invalid reattach descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Executor (pid {0}) is no longer running")]
    ExecutorGone(u32),

    #[error("Executor unreachable at {addr}: {reason}")]
    Unreachable { addr: String, reason: String },

    #[error("Executor at {addr} is instance {found}, expected {expected}")]
    InstanceMismatch {
        addr: String,
        expected: String,
        found: String,
    },

    #[error("Executor connection lost: {0}")]
    ConnectionLost(String),

    #[error("Executor RPC error ({code}): {message}")]
    Rpc { code: i32, message: String },
}

/// Live connection to one executor
///
/// Exclusively owned by a single process handle. The executor behind it runs
/// at most one process.
#[async_trait]
pub trait ExecutorConnection: Send + Sync {
    /// Descriptor a restarted agent can reconnect with
    fn reattach_descriptor(&self) -> ReattachDescriptor;

    /// Start the process
    ///
    /// # Errors
    /// - ExecutorError::Rpc if the executor could not start it
    async fn launch_cmd(
        &self,
        command: &ExecCommand,
        context: &ExecutorContext,
    ) -> Result<ProcessState, ExecutorError>;

    /// Block until the process exits
    async fn wait(&self) -> Result<ProcessState, ExecutorError>;

    /// Ask the process to stop gracefully
    async fn shutdown(&self) -> Result<(), ExecutorError>;

    /// Forcefully terminate the process
    async fn exit(&self) -> Result<(), ExecutorError>;

    /// Terminate the executor itself and release the connection
    async fn teardown(&self);
}

/// Freshly launched process and the connection that owns it
pub struct LaunchedProcess {
    pub connection: Arc<dyn ExecutorConnection>,
    pub pid: u32,
}

/// Opens executor connections
///
/// Implementations:
/// - RpcExecutorClient: spawns `qvisor executor` subprocesses over JSON-RPC
/// - mocks::MockExecutorClient: in-memory executors for tests
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    /// Spawn a new executor and complete its handshake
    async fn spawn(
        &self,
        context: &ExecutorContext,
    ) -> Result<Arc<dyn ExecutorConnection>, ExecutorError>;

    /// Connect to a running executor without starting anything
    ///
    /// # Errors
    /// - ExecutorError::InvalidDescriptor if the descriptor is malformed
    /// - ExecutorError::ExecutorGone if the executor process no longer exists
    /// - ExecutorError::Unreachable if it exists but cannot be reached
    /// - ExecutorError::InstanceMismatch if another executor answers
    async fn reattach(
        &self,
        descriptor: &ReattachDescriptor,
    ) -> Result<Arc<dyn ExecutorConnection>, ExecutorError>;

    /// Spawn an executor and start `command` through it
    ///
    /// The executor is torn down before returning if the start fails.
    async fn launch(
        &self,
        command: &ExecCommand,
        context: &ExecutorContext,
    ) -> Result<LaunchedProcess, ExecutorError> {
        let connection = self.spawn(context).await?;

        match connection.launch_cmd(command, context).await {
            Ok(state) => Ok(LaunchedProcess {
                connection,
                pid: state.pid,
            }),
            Err(e) => {
                warn!(
                    task = %context.task_name,
                    error = %e,
                    "Executor could not start process, tearing it down"
                );
                connection.teardown().await;
                Err(ExecutorError::LaunchFailed(e.to_string()))
            }
        }
    }
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::watch;

    /// Signal number reported for a graceful stop
    pub const SIGTERM: i32 = 15;
    /// Signal number reported for a forced stop
    pub const SIGKILL: i32 = 9;

    type Outcome = Option<Result<ProcessState, String>>;

    /// How a mock executor behaves
    #[derive(Debug, Clone, Default)]
    pub struct MockBehavior {
        /// Process exits when asked to shut down gracefully
        pub exit_on_shutdown: bool,
        /// launch_cmd fails with this message
        pub fail_launch: Option<String>,
        /// exit() fails with this message
        pub fail_exit: Option<String>,
    }

    /// In-memory executor connection
    pub struct MockExecutorConnection {
        descriptor: ReattachDescriptor,
        user_pid: u32,
        behavior: MockBehavior,
        outcome: watch::Sender<Outcome>,
        launch_calls: AtomicUsize,
        wait_calls: AtomicUsize,
        shutdown_calls: AtomicUsize,
        exit_calls: AtomicUsize,
        teardown_calls: AtomicUsize,
    }

    impl MockExecutorConnection {
        pub fn new(descriptor: ReattachDescriptor, user_pid: u32, behavior: MockBehavior) -> Self {
            let (outcome, _) = watch::channel(None);
            Self {
                descriptor,
                user_pid,
                behavior,
                outcome,
                launch_calls: AtomicUsize::new(0),
                wait_calls: AtomicUsize::new(0),
                shutdown_calls: AtomicUsize::new(0),
                exit_calls: AtomicUsize::new(0),
                teardown_calls: AtomicUsize::new(0),
            }
        }

        /// Simulate the process exiting on its own
        pub fn finish(&self, exit_code: i32, signal: i32) {
            let state = ProcessState {
                pid: self.user_pid,
                exit_code,
                signal,
            };
            self.outcome.send_if_modified(|current| {
                if current.is_some() {
                    return false;
                }
                *current = Some(Ok(state));
                true
            });
        }

        /// Simulate the executor connection dropping mid-wait
        pub fn drop_connection(&self, reason: impl Into<String>) {
            let reason = reason.into();
            self.outcome.send_if_modified(|current| {
                if current.is_some() {
                    return false;
                }
                *current = Some(Err(reason));
                true
            });
        }

        pub fn has_exited(&self) -> bool {
            self.outcome.borrow().is_some()
        }

        pub fn launch_calls(&self) -> usize {
            self.launch_calls.load(Ordering::SeqCst)
        }
        pub fn wait_calls(&self) -> usize {
            self.wait_calls.load(Ordering::SeqCst)
        }
        pub fn shutdown_calls(&self) -> usize {
            self.shutdown_calls.load(Ordering::SeqCst)
        }
        pub fn exit_calls(&self) -> usize {
            self.exit_calls.load(Ordering::SeqCst)
        }
        pub fn teardown_calls(&self) -> usize {
            self.teardown_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExecutorConnection for MockExecutorConnection {
        fn reattach_descriptor(&self) -> ReattachDescriptor {
            self.descriptor.clone()
        }

        async fn launch_cmd(
            &self,
            _command: &ExecCommand,
            _context: &ExecutorContext,
        ) -> Result<ProcessState, ExecutorError> {
            self.launch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(msg) = &self.behavior.fail_launch {
                return Err(ExecutorError::Rpc {
                    code: 5002,
                    message: msg.clone(),
                });
            }
            Ok(ProcessState {
                pid: self.user_pid,
                exit_code: 0,
                signal: 0,
            })
        }

        async fn wait(&self) -> Result<ProcessState, ExecutorError> {
            self.wait_calls.fetch_add(1, Ordering::SeqCst);
            let mut rx = self.outcome.subscribe();
            let outcome = rx
                .wait_for(|o| o.is_some())
                .await
                .map_err(|e| ExecutorError::ConnectionLost(e.to_string()))?
                .clone();
            match outcome {
                Some(Ok(state)) => Ok(state),
                Some(Err(reason)) => Err(ExecutorError::ConnectionLost(reason)),
                None => Err(ExecutorError::ConnectionLost("no outcome".to_string())),
            }
        }

        async fn shutdown(&self) -> Result<(), ExecutorError> {
            self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
            if self.behavior.exit_on_shutdown {
                self.finish(128 + SIGTERM, SIGTERM);
            }
            Ok(())
        }

        async fn exit(&self) -> Result<(), ExecutorError> {
            self.exit_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(msg) = &self.behavior.fail_exit {
                return Err(ExecutorError::Rpc {
                    code: 5002,
                    message: msg.clone(),
                });
            }
            self.finish(128 + SIGKILL, SIGKILL);
            Ok(())
        }

        async fn teardown(&self) {
            self.teardown_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Executor client backed by in-memory executors
    ///
    /// Executors outlive the handles that spawned them, so `reattach` with a
    /// previously issued descriptor returns the same executor.
    pub struct MockExecutorClient {
        behavior: Mutex<MockBehavior>,
        executors: Mutex<HashMap<String, Arc<MockExecutorConnection>>>,
        spawned: Mutex<Vec<Arc<MockExecutorConnection>>>,
        unreachable: Mutex<bool>,
        next_pid: AtomicU32,
    }

    impl MockExecutorClient {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior: Mutex::new(behavior),
                executors: Mutex::new(HashMap::new()),
                spawned: Mutex::new(Vec::new()),
                unreachable: Mutex::new(false),
                next_pid: AtomicU32::new(1000),
            }
        }

        pub fn set_behavior(&self, behavior: MockBehavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        /// Make every reattach fail as if the endpoint were down
        pub fn set_unreachable(&self, unreachable: bool) {
            *self.unreachable.lock().unwrap() = unreachable;
        }

        /// Simulate an executor process dying
        pub fn kill_executor(&self, instance_id: &str) {
            self.executors.lock().unwrap().remove(instance_id);
        }

        pub fn spawned(&self) -> Vec<Arc<MockExecutorConnection>> {
            self.spawned.lock().unwrap().clone()
        }

        pub fn spawn_count(&self) -> usize {
            self.spawned.lock().unwrap().len()
        }

        pub fn executor(&self, instance_id: &str) -> Option<Arc<MockExecutorConnection>> {
            self.executors.lock().unwrap().get(instance_id).cloned()
        }
    }

    #[async_trait]
    impl ExecutorClient for MockExecutorClient {
        async fn spawn(
            &self,
            _context: &ExecutorContext,
        ) -> Result<Arc<dyn ExecutorConnection>, ExecutorError> {
            let executor_pid = self.next_pid.fetch_add(2, Ordering::SeqCst);
            let instance_id = format!("mock-{}", executor_pid);
            let descriptor = ReattachDescriptor::new(
                ([127, 0, 0, 1], 40000 + (executor_pid % 20000) as u16).into(),
                executor_pid,
                instance_id.clone(),
            );
            let behavior = self.behavior.lock().unwrap().clone();
            let connection = Arc::new(MockExecutorConnection::new(
                descriptor,
                executor_pid + 1,
                behavior,
            ));

            self.executors
                .lock()
                .unwrap()
                .insert(instance_id, connection.clone());
            self.spawned.lock().unwrap().push(connection.clone());
            Ok(connection)
        }

        async fn reattach(
            &self,
            descriptor: &ReattachDescriptor,
        ) -> Result<Arc<dyn ExecutorConnection>, ExecutorError> {
            descriptor
                .validate()
                .map_err(ExecutorError::InvalidDescriptor)?;

            let executor = self.executor(&descriptor.instance_id);
            let Some(executor) = executor else {
                return Err(ExecutorError::ExecutorGone(descriptor.pid));
            };
            if *self.unreachable.lock().unwrap() {
                return Err(ExecutorError::Unreachable {
                    addr: descriptor.addr.clone(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(executor)
        }
    }
}
