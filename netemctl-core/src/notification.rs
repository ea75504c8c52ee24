//! Unbounded, single-consumer event queue (C2).

use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// One lifecycle event: `(action, payload, metadata)`.
#[derive(Debug, Clone)]
pub struct Notification {
    pub action: String,
    pub event: Value,
    pub metadata: Map<String, Value>,
}

/// Producer handle, cloned freely; `put_nowait` never blocks and never fails
/// observably (a dropped receiver just drops the event).
#[derive(Debug, Clone)]
pub struct NotificationSender(mpsc::UnboundedSender<Notification>);

impl NotificationSender {
    pub fn put_nowait(&self, notification: Notification) {
        let _ = self.0.send(notification);
    }
}

/// Consumer half. Exactly one per queue; `get` suspends until an event
/// arrives and is cancellable by dropping the future.
#[derive(Debug)]
pub struct NotificationQueue(mpsc::UnboundedReceiver<Notification>);

impl NotificationQueue {
    pub fn channel() -> (NotificationSender, NotificationQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (NotificationSender(tx), NotificationQueue(rx))
    }

    pub async fn get(&mut self) -> Option<Notification> {
        self.0.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_nowait_never_blocks_and_get_delivers_fifo() {
        let (tx, mut rx) = NotificationQueue::channel();
        tx.put_nowait(Notification {
            action: "node.created".into(),
            event: Value::Null,
            metadata: Map::new(),
        });
        tx.put_nowait(Notification {
            action: "node.updated".into(),
            event: Value::Null,
            metadata: Map::new(),
        });

        assert_eq!(rx.get().await.unwrap().action, "node.created");
        assert_eq!(rx.get().await.unwrap().action, "node.updated");
    }

    #[tokio::test]
    async fn get_returns_none_after_all_senders_dropped() {
        let (tx, mut rx) = NotificationQueue::channel();
        drop(tx);
        assert!(rx.get().await.is_none());
    }
}
