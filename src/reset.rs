/// Rendezvous channel used by the supervisor to clear the monitor's stall state.
///
/// `ResetSender::notify` does not return until the monitor has taken the
/// notice and acknowledged it, so no poll can be attributed to a new child
/// using the previous child's state.
use tokio::sync::{mpsc, oneshot};

/// Create a connected sender/receiver pair.
pub fn reset_channel() -> (ResetSender, ResetReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (ResetSender { tx }, ResetReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct ResetSender {
    tx: mpsc::Sender<ResetNotice>,
}

#[derive(Debug)]
pub struct ResetReceiver {
    rx: mpsc::Receiver<ResetNotice>,
}

/// A pending reset request. Dropping it without acknowledging releases the
/// sender with a failure.
#[derive(Debug)]
pub struct ResetNotice {
    ack: oneshot::Sender<()>,
}

impl ResetSender {
    /// Send a reset and wait until the receiver acknowledges it.
    ///
    /// Returns `false` if the receiver is gone or dropped the notice.
    pub async fn notify(&self) -> bool {
        let (ack, done) = oneshot::channel();
        if self.tx.send(ResetNotice { ack }).await.is_err() {
            return false;
        }
        done.await.is_ok()
    }
}

impl ResetReceiver {
    /// Wait for the next reset request. `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<ResetNotice> {
        self.rx.recv().await
    }
}

impl ResetNotice {
    /// Release the waiting sender.
    pub fn acknowledge(self) {
        let _ = self.ack.send(());
    }
}
