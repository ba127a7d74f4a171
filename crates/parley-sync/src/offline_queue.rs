//! Durable FIFO of actions waiting for the remote store.
//!
//! Actions of every kind share one queue so replay follows the order the
//! user performed them in. A drain applies the head, removes it, and moves
//! on; the first failure stops the drain and leaves that action at the head
//! with its retry counter bumped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use parley_remote::path;
use parley_shared::{ActionPayload, PendingAction};

use crate::context::Shared;
use crate::error::{Result, SyncError};
use crate::events::SyncEvent;

/// Applies one queued action to the remote store.
#[async_trait]
pub trait ActionApplier: Send + Sync {
    async fn apply(&self, action: &ActionPayload) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub remaining: usize,
    /// Sequence number of the action that stopped the drain.
    pub stopped_at: Option<i64>,
}

pub struct OfflineQueue {
    shared: Arc<Shared>,
    draining: AtomicBool,
}

/// Clears the draining flag however the drain ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl OfflineQueue {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            draining: AtomicBool::new(false),
        }
    }

    /// Reject actions that can never succeed.
    pub fn validate(&self, action: &ActionPayload) -> Result<()> {
        let me = &self.shared.me;
        let invalid = |reason: String| Err(SyncError::Validation(reason));
        match action {
            ActionPayload::Follow { target } | ActionPayload::Unfollow { target } => {
                if !path::is_valid_key(target.as_str()) {
                    return invalid(format!("invalid user id '{target}'"));
                }
                if target == me {
                    return invalid("cannot follow yourself".into());
                }
            }
            ActionPayload::CreatePost {
                post_id,
                channel_id,
                body,
                ..
            } => {
                if !path::is_valid_key(post_id) {
                    return invalid(format!("invalid post id '{post_id}'"));
                }
                if body.trim().is_empty() {
                    return invalid("post body is empty".into());
                }
                if let Some(channel) = channel_id {
                    if !path::is_valid_key(channel) {
                        return invalid(format!("invalid channel id '{channel}'"));
                    }
                }
            }
            ActionPayload::AddReaction { post_id, emoji }
            | ActionPayload::RemoveReaction { post_id, emoji } => {
                if !path::is_valid_key(post_id) {
                    return invalid(format!("invalid post id '{post_id}'"));
                }
                if !path::is_valid_key(emoji) {
                    return invalid(format!("invalid reaction key '{emoji}'"));
                }
            }
            ActionPayload::SendMessage { room_id, msg_id } => {
                if !path::is_valid_key(room_id.as_str()) || !path::is_valid_key(msg_id.as_str()) {
                    return invalid(format!("invalid message reference {room_id}/{msg_id}"));
                }
            }
        }
        Ok(())
    }

    /// Append `action` to the tail of the queue.
    pub fn enqueue(&self, action: ActionPayload) -> Result<PendingAction> {
        self.validate(&action)?;
        let pending = self.shared.cache.with_db(|db| db.enqueue_action(&action))?;
        info!(seq = pending.seq, kind = action.kind(), "action queued");
        Ok(pending)
    }

    pub fn pending(&self) -> Result<Vec<PendingAction>> {
        self.shared.cache.with_db(|db| db.list_actions())
    }

    pub fn len(&self) -> Result<usize> {
        self.shared.cache.with_db(|db| db.count_actions())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Replay queued actions head-first until the queue is empty or one
    /// fails. A drain already in progress makes this a no-op.
    pub async fn drain(&self, applier: &dyn ActionApplier) -> Result<DrainReport> {
        if self.draining.swap(true, Ordering::SeqCst) {
            debug!("queue drain already running");
            return Ok(DrainReport {
                remaining: self.len()?,
                ..DrainReport::default()
            });
        }
        let _guard = DrainGuard(&self.draining);

        let mut report = DrainReport::default();
        while let Some(head) = self.shared.cache.with_db(|db| db.peek_action())? {
            match applier.apply(&head.action).await {
                Ok(()) => {
                    self.shared.cache.with_db(|db| db.remove_action(head.seq))?;
                    debug!(seq = head.seq, kind = head.action.kind(), "queued action applied");
                    report.applied += 1;
                }
                Err(e) => {
                    let retries = self.shared.cache.with_db(|db| db.bump_retry(head.seq))?;
                    warn!(
                        seq = head.seq,
                        kind = head.action.kind(),
                        retries,
                        error = %e,
                        "queue drain stopped"
                    );
                    report.stopped_at = Some(head.seq);
                    break;
                }
            }
        }

        report.remaining = self.len()?;
        if report.applied > 0 || report.stopped_at.is_some() {
            info!(applied = report.applied, remaining = report.remaining, "queue drained");
        }
        self.shared.events.emit(SyncEvent::QueueDrained {
            applied: report.applied,
            remaining: report.remaining,
        });
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use parley_remote::MemoryBackend;
    use parley_shared::{MsgId, RoomId, UserId};

    use super::*;
    use crate::test_support::harness;

    /// Records applied actions and fails the `fail_at`-th call (0-based).
    struct Recorder {
        applied: Mutex<Vec<ActionPayload>>,
        calls: Mutex<usize>,
        fail_at: Option<usize>,
    }

    impl Recorder {
        fn new(fail_at: Option<usize>) -> Self {
            Self {
                applied: Mutex::new(Vec::new()),
                calls: Mutex::new(0),
                fail_at,
            }
        }
    }

    #[async_trait]
    impl ActionApplier for Recorder {
        async fn apply(&self, action: &ActionPayload) -> Result<()> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls - 1
            };
            if Some(call) == self.fail_at {
                return Err(SyncError::Transient(parley_remote::RemoteError::Unavailable));
            }
            self.applied.lock().unwrap().push(action.clone());
            Ok(())
        }
    }

    fn follow(target: &str) -> ActionPayload {
        ActionPayload::Follow {
            target: UserId::from(target),
        }
    }

    #[test]
    fn validation_rejects_bad_actions() {
        let backend = MemoryBackend::new();
        let h = harness(&backend, "alice");
        let queue = OfflineQueue::new(h.shared.clone());

        assert!(queue.validate(&follow("bob")).is_ok());
        assert!(queue.validate(&follow("")).is_err());
        assert!(queue.validate(&follow("alice")).is_err());
        assert!(queue
            .validate(&ActionPayload::AddReaction {
                post_id: "p1".into(),
                emoji: "a.b".into(),
            })
            .is_err());
        assert!(queue
            .validate(&ActionPayload::CreatePost {
                post_id: "p1".into(),
                channel_id: None,
                body: "   ".into(),
                created_at: 0,
            })
            .is_err());
        assert!(queue.enqueue(follow("")).is_err());
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn drain_applies_in_enqueue_order() {
        let backend = MemoryBackend::new();
        let h = harness(&backend, "alice");
        let queue = OfflineQueue::new(h.shared.clone());
        let actions = vec![
            follow("bob"),
            ActionPayload::SendMessage {
                room_id: RoomId::from("alicebob"),
                msg_id: MsgId::from("m1"),
            },
            follow("carol"),
        ];
        for action in &actions {
            queue.enqueue(action.clone()).unwrap();
        }
        let mut events = h.shared.events.subscribe();

        let recorder = Recorder::new(None);
        let report = queue.drain(&recorder).await.unwrap();

        assert_eq!(report.applied, 3);
        assert_eq!(report.remaining, 0);
        assert_eq!(*recorder.applied.lock().unwrap(), actions);
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::QueueDrained {
                applied: 3,
                remaining: 0
            }
        );
    }

    #[tokio::test]
    async fn failure_stops_drain_and_keeps_tail() {
        let backend = MemoryBackend::new();
        let h = harness(&backend, "alice");
        let queue = OfflineQueue::new(h.shared.clone());
        let targets = ["b1", "b2", "b3", "b4", "b5", "b6"];
        for target in targets {
            queue.enqueue(follow(target)).unwrap();
        }

        let k = targets.len();
        let report = queue.drain(&Recorder::new(Some(k / 2))).await.unwrap();
        assert_eq!(report.applied, k / 2);
        assert_eq!(report.remaining, k - k / 2);

        let pending = queue.pending().unwrap();
        assert_eq!(pending[0].action, follow("b4"));
        assert_eq!(pending[0].retry_count, 1);
        assert_eq!(report.stopped_at, Some(pending[0].seq));

        let recorder = Recorder::new(None);
        let report = queue.drain(&recorder).await.unwrap();
        assert_eq!(report.applied, k - k / 2);
        assert_eq!(
            *recorder.applied.lock().unwrap(),
            vec![follow("b4"), follow("b5"), follow("b6")]
        );
    }
}
