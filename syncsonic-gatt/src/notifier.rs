//! Queues outbound frames (phase updates, scan results, acks) for delivery as GATT notifications,
//! decoupling whoever produces them (the connection FSM, the scanner, a command handler) from the
//! D-Bus server task that actually owns the characteristic and can emit `PropertiesChanged`.

use crate::frame::Frame;
use async_channel::{Receiver, Sender};
use thiserror::Error;

const QUEUE_CAPACITY: usize = 64;

/// The notification queue is gone; the server task that drained it has shut down.
#[derive(Debug, Error)]
#[error("notification queue closed")]
pub struct NotifyError;

/// A cheaply-cloneable handle for enqueueing frames to be notified to the phone.
#[derive(Clone, Debug)]
pub struct Notifier {
    tx: Sender<Frame>,
}

impl Notifier {
    /// Create a notifier and the receiver its frames are drained from. The receiver is owned by
    /// the GATT server task, which turns each frame into a characteristic-value notification.
    pub fn new() -> (Self, Receiver<Frame>) {
        let (tx, rx) = async_channel::bounded(QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    /// Enqueue a frame for notification. Backpressures the caller if the server task has fallen
    /// behind; fails only once the queue itself has been torn down.
    pub async fn notify(&self, frame: Frame) -> Result<(), NotifyError> {
        self.tx.send(frame).await.map_err(|_| NotifyError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Opcode;
    use serde_json::json;

    #[tokio::test]
    async fn notified_frame_is_received() {
        let (notifier, rx) = Notifier::new();
        let frame = Frame::new(Opcode::ScanDevice, json!({"mac": "AA:BB:CC:DD:EE:01"}));
        notifier.notify(frame.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn notify_fails_once_receiver_dropped() {
        let (notifier, rx) = Notifier::new();
        drop(rx);
        let frame = Frame::new(Opcode::ScanDevice, json!({}));
        assert!(notifier.notify(frame).await.is_err());
    }
}
