// Process Handle
//
// Live control object for one supervised VM process. A background supervisor
// waits on the executor; the handle exposes kill, identity and the result.

pub mod done;
pub mod result;
mod supervisor;

pub use done::DoneSignal;
pub use result::ResultChannel;

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::{HandleIdentity, HandleState, WaitResult};
use crate::error::Result;
use crate::port::{ExecutorConnection, ExecutorError};
use supervisor::Supervisor;

/// Apply a lifecycle transition, ignoring ones the state machine refuses
fn transition(state: &watch::Sender<HandleState>, next: HandleState) -> bool {
    state.send_if_modified(|current| {
        if current.can_transition_to(next) {
            *current = next;
            true
        } else {
            false
        }
    })
}

pub struct ProcessHandle {
    task_name: String,
    user_pid: u32,
    kill_timeout: RwLock<Duration>,
    connection: Arc<dyn ExecutorConnection>,
    state: Arc<watch::Sender<HandleState>>,
    done: DoneSignal,
    results: ResultChannel,
}

impl ProcessHandle {
    /// Take ownership of an executor connection and start supervising it
    ///
    /// Used for both fresh launches and reattached executors; the supervisor
    /// starts waiting immediately.
    pub fn supervise(
        task_name: impl Into<String>,
        connection: Arc<dyn ExecutorConnection>,
        user_pid: u32,
        kill_timeout: Duration,
    ) -> Self {
        let task_name = task_name.into();
        let (notifier, done) = done::done_channel();
        let (publisher, results) = result::result_channel();
        let (state, _) = watch::channel(HandleState::Starting);
        let state = Arc::new(state);

        Supervisor {
            task_name: task_name.clone(),
            user_pid,
            connection: connection.clone(),
            done: notifier,
            results: publisher,
            state: state.clone(),
        }
        .spawn();

        // Refused if the supervisor already saw the process exit
        transition(&state, HandleState::Running);

        Self {
            task_name,
            user_pid,
            kill_timeout: RwLock::new(kill_timeout),
            connection,
            state,
            done,
            results,
        }
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn user_pid(&self) -> u32 {
        self.user_pid
    }

    pub fn state(&self) -> HandleState {
        *self.state.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.done.is_done()
    }

    pub fn done_signal(&self) -> DoneSignal {
        self.done.clone()
    }

    pub fn kill_timeout(&self) -> Duration {
        match self.kill_timeout.read() {
            Ok(timeout) => *timeout,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Change the grace period used by later kills and identities
    pub fn update_kill_timeout(&self, timeout: Duration) {
        match self.kill_timeout.write() {
            Ok(mut current) => *current = timeout,
            Err(poisoned) => *poisoned.into_inner() = timeout,
        }
    }

    /// Encode the durable identity of this handle
    ///
    /// Decoding the result with a driver yields a handle bound to the same
    /// executor, pid and kill timeout.
    pub fn identity(&self) -> Result<String> {
        let identity = HandleIdentity {
            kill_timeout: self.kill_timeout(),
            user_pid: self.user_pid,
            reattach: self.connection.reattach_descriptor(),
        };
        Ok(identity.encode()?)
    }

    /// The handle's result channel
    pub fn result_channel(&self) -> ResultChannel {
        self.results.clone()
    }

    /// Wait for the terminal result; `None` if it was already taken
    pub async fn wait(&self) -> Option<WaitResult> {
        self.results.recv().await
    }

    /// Stop the process: graceful request first, forced exit after the kill timeout
    ///
    /// Returns once the process is confirmed gone or the forced exit has been
    /// issued. A failed graceful request is logged, never returned.
    ///
    /// # Errors
    /// - The error of the forced exit call, if the grace period ran out
    pub async fn kill(&self) -> std::result::Result<(), ExecutorError> {
        let mut done = self.done.clone();
        if done.is_done() {
            return Ok(());
        }

        let kill_timeout = self.kill_timeout();
        let deadline = Instant::now() + kill_timeout;
        transition(&self.state, HandleState::Stopping);

        match tokio::time::timeout_at(deadline, self.connection.shutdown()).await {
            Ok(Ok(())) => {
                debug!(task = %self.task_name, pid = %self.user_pid, "Requested graceful shutdown")
            }
            Ok(Err(e)) => warn!(
                task = %self.task_name,
                pid = %self.user_pid,
                error = %e,
                "Graceful shutdown request failed"
            ),
            Err(_) => warn!(
                task = %self.task_name,
                pid = %self.user_pid,
                "Graceful shutdown request did not return within kill timeout"
            ),
        }

        tokio::select! {
            biased;
            _ = done.wait() => {
                info!(task = %self.task_name, pid = %self.user_pid, "Process stopped gracefully");
                Ok(())
            }
            _ = tokio::time::sleep_until(deadline) => {
                info!(
                    task = %self.task_name,
                    pid = %self.user_pid,
                    kill_timeout_ms = %kill_timeout.as_millis(),
                    "Process still running after kill timeout, forcing exit"
                );
                self.connection.exit().await
            }
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("task_name", &self.task_name)
            .field("user_pid", &self.user_pid)
            .field("state", &self.state())
            .field("kill_timeout", &self.kill_timeout())
            .finish()
    }
}
