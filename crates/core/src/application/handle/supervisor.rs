// Supervisor loop: one per process handle

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::done::DoneNotifier;
use super::result::ResultPublisher;
use super::transition;
use crate::domain::{HandleState, WaitResult};
use crate::port::ExecutorConnection;

pub(super) struct Supervisor {
    pub task_name: String,
    pub user_pid: u32,
    pub connection: Arc<dyn ExecutorConnection>,
    pub done: DoneNotifier,
    pub results: ResultPublisher,
    pub state: Arc<watch::Sender<HandleState>>,
}

impl Supervisor {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Wait for exit, then: done, result, teardown (in that order)
    async fn run(self) {
        let outcome = self.connection.wait().await;

        // Kill watches this; it must not wait on the result being drained
        self.done.close();

        let result = match outcome {
            Ok(state) => {
                info!(
                    task = %self.task_name,
                    pid = %self.user_pid,
                    exit_code = %state.exit_code,
                    signal = %state.signal,
                    "Process exited"
                );
                WaitResult::from(state)
            }
            Err(e) => {
                error!(
                    task = %self.task_name,
                    pid = %self.user_pid,
                    error = %e,
                    "Lost track of process, exit status unknown"
                );
                WaitResult::unknown(e.to_string())
            }
        };

        transition(&self.state, HandleState::Exited);
        self.results.publish(result);
        self.connection.teardown().await;
    }
}
