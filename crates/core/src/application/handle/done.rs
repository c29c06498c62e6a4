// Done signal: closes once the executor confirms the process exited

use tokio::sync::watch;

/// Observer side of the done signal
#[derive(Clone)]
pub struct DoneSignal {
    rx: watch::Receiver<bool>,
}

impl DoneSignal {
    /// Check if the process has been observed exiting
    pub fn is_done(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the signal to close, returns at once if it already has
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|done| *done).await;
    }
}

/// Closing side, held by the supervisor
pub struct DoneNotifier {
    tx: watch::Sender<bool>,
}

impl DoneNotifier {
    /// Close the signal; only the first call has an effect
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|done| {
            if *done {
                return false;
            }
            *done = true;
            true
        })
    }
}

/// Create a done signal
pub fn done_channel() -> (DoneNotifier, DoneSignal) {
    let (tx, rx) = watch::channel(false);
    (DoneNotifier { tx }, DoneSignal { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_closes_exactly_once() {
        let (notifier, signal) = done_channel();
        assert!(!signal.is_done());

        assert!(notifier.close());
        assert!(!notifier.close());
        assert!(signal.is_done());
    }

    #[tokio::test]
    async fn test_wait_after_close_returns_immediately() {
        let (notifier, mut signal) = done_channel();
        notifier.close();

        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .expect("wait must not block once closed");
    }

    #[tokio::test]
    async fn test_wait_wakes_all_observers() {
        let (notifier, signal) = done_channel();
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let mut s = signal.clone();
            waiters.push(tokio::spawn(async move { s.wait().await }));
        }

        notifier.close();
        for w in waiters {
            tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
