// Single-delivery result channel

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::domain::WaitResult;

/// Read-only view of a handle's terminal result
///
/// Delivers one WaitResult, then reports closure (`None`) to every read,
/// including reads that were already waiting.
#[derive(Clone)]
pub struct ResultChannel {
    rx: Arc<Mutex<mpsc::Receiver<WaitResult>>>,
}

impl ResultChannel {
    /// Receive the result, or `None` once it has been taken
    pub async fn recv(&self) -> Option<WaitResult> {
        self.rx.lock().await.recv().await
    }
}

/// Producer side, consumed by the single publish
pub struct ResultPublisher {
    tx: mpsc::Sender<WaitResult>,
}

impl ResultPublisher {
    /// Publish the result and close the channel
    pub fn publish(self, result: WaitResult) {
        if let Err(e) = self.tx.try_send(result) {
            debug!(error = %e, "Result channel has no readers left");
        }
    }
}

/// Create a result channel
pub fn result_channel() -> (ResultPublisher, ResultChannel) {
    let (tx, rx) = mpsc::channel(1);
    (
        ResultPublisher { tx },
        ResultChannel {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}
