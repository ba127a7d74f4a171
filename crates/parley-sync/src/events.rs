use tokio::sync::broadcast;

use parley_shared::{MsgId, RoomId, UserId};

/// Notification-style events for consumers that do not watch the reactive
/// containers (notifications, badges, logging).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A message from another user arrived on a live room listener.
    NewMessage {
        room_id: RoomId,
        msg_id: MsgId,
        sender: UserId,
    },
    /// A send could not reach the remote store; the message was queued.
    SendFailed {
        room_id: RoomId,
        msg_id: MsgId,
        reason: String,
    },
    /// The offline queue was drained.
    QueueDrained { applied: usize, remaining: usize },
    ConnectivityChanged { online: bool },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("no event subscribers");
        }
    }
}
