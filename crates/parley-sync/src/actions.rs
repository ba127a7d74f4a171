//! Social actions: follow, posts and reactions.
//!
//! Each action is applied directly when online and the offline queue is
//! empty; otherwise it joins the queue behind earlier actions so the global
//! order is kept.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use parley_remote::path;
use parley_shared::protocol::{now_millis, PostRecord};
use parley_shared::{ActionPayload, MsgId, UserId};

use crate::context::Shared;
use crate::error::{Result, SyncError};
use crate::offline_queue::OfflineQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Applied,
    /// Waiting in the offline queue at this sequence number.
    Queued(i64),
}

pub struct SocialActions {
    shared: Arc<Shared>,
    queue: Arc<OfflineQueue>,
}

impl SocialActions {
    pub(crate) fn new(shared: Arc<Shared>, queue: Arc<OfflineQueue>) -> Self {
        Self { shared, queue }
    }

    pub async fn follow(&self, target: &UserId) -> Result<ActionOutcome> {
        self.submit(ActionPayload::Follow {
            target: target.clone(),
        })
        .await
    }

    pub async fn unfollow(&self, target: &UserId) -> Result<ActionOutcome> {
        self.submit(ActionPayload::Unfollow {
            target: target.clone(),
        })
        .await
    }

    /// Publish a post. The id is generated up front so a queued post keeps
    /// it when replayed.
    pub async fn create_post(&self, channel_id: Option<&str>, body: &str) -> Result<(String, ActionOutcome)> {
        let post_id = MsgId::generate().0;
        let outcome = self
            .submit(ActionPayload::CreatePost {
                post_id: post_id.clone(),
                channel_id: channel_id.map(str::to_string),
                body: body.to_string(),
                created_at: now_millis(),
            })
            .await?;
        Ok((post_id, outcome))
    }

    pub async fn add_reaction(&self, post_id: &str, emoji: &str) -> Result<ActionOutcome> {
        self.submit(ActionPayload::AddReaction {
            post_id: post_id.to_string(),
            emoji: emoji.to_string(),
        })
        .await
    }

    pub async fn remove_reaction(&self, post_id: &str, emoji: &str) -> Result<ActionOutcome> {
        self.submit(ActionPayload::RemoveReaction {
            post_id: post_id.to_string(),
            emoji: emoji.to_string(),
        })
        .await
    }

    async fn submit(&self, action: ActionPayload) -> Result<ActionOutcome> {
        self.queue.validate(&action)?;

        if !self.shared.remote.is_connected() || !self.queue.is_empty()? {
            let pending = self.queue.enqueue(action)?;
            return Ok(ActionOutcome::Queued(pending.seq));
        }

        match apply_social(&self.shared, &action).await {
            Ok(()) => {
                debug!(kind = action.kind(), "action applied");
                Ok(ActionOutcome::Applied)
            }
            Err(e) if e.is_transient() => {
                warn!(kind = action.kind(), error = %e, "action failed, queued for replay");
                let pending = self.queue.enqueue(action)?;
                Ok(ActionOutcome::Queued(pending.seq))
            }
            Err(e) => Err(e),
        }
    }
}

/// Apply one social action to the remote store. Every write sets a final
/// state, so replaying an action that already landed is harmless.
pub(crate) async fn apply_social(shared: &Shared, action: &ActionPayload) -> Result<()> {
    let me = &shared.me;
    let remote = &shared.remote;
    match action {
        ActionPayload::Follow { target } => {
            remote.update("", follow_patch(me, target, Value::Bool(true))).await?;
        }
        ActionPayload::Unfollow { target } => {
            remote.update("", follow_patch(me, target, Value::Null)).await?;
        }
        ActionPayload::CreatePost {
            post_id,
            channel_id,
            body,
            created_at,
        } => {
            let record = PostRecord {
                author: me.clone(),
                body: body.clone(),
                channel_id: channel_id.clone(),
                created_at: *created_at,
            };
            remote.set(&path::post(post_id), record.to_value()?).await?;
        }
        ActionPayload::AddReaction { post_id, emoji } => {
            remote
                .set(&path::reaction(post_id, emoji, me), Value::Bool(true))
                .await?;
        }
        ActionPayload::RemoveReaction { post_id, emoji } => {
            remote.remove(&path::reaction(post_id, emoji, me)).await?;
        }
        ActionPayload::SendMessage { .. } => {
            return Err(SyncError::Validation(
                "message sends are replayed by the message engine".into(),
            ));
        }
    }
    Ok(())
}

/// Both sides of a follow edge, written in one atomic update.
fn follow_patch(me: &UserId, target: &UserId, value: Value) -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert(path::following(me, target), value.clone());
    patch.insert(path::follower(target, me), value);
    patch
}

#[cfg(test)]
mod tests {
    use parley_remote::{MemoryBackend, WriteKind};
    use serde_json::json;

    use super::*;
    use crate::test_support::harness;

    fn actions(h: &crate::test_support::Harness) -> SocialActions {
        let queue = Arc::new(OfflineQueue::new(h.shared.clone()));
        SocialActions::new(h.shared.clone(), queue)
    }

    #[tokio::test]
    async fn follow_writes_both_edges_atomically() {
        let backend = MemoryBackend::new();
        let h = harness(&backend, "alice");
        let social = actions(&h);

        let outcome = social.follow(&UserId::from("bob")).await.unwrap();
        assert_eq!(outcome, ActionOutcome::Applied);
        assert_eq!(backend.value_at("following/alice/bob"), Some(json!(true)));
        assert_eq!(backend.value_at("followers/bob/alice"), Some(json!(true)));
        let log = backend.write_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, WriteKind::Update);

        social.unfollow(&UserId::from("bob")).await.unwrap();
        assert_eq!(backend.value_at("following/alice/bob"), None);
        assert_eq!(backend.value_at("followers/bob"), None);
    }

    #[tokio::test]
    async fn offline_actions_are_queued() {
        let backend = MemoryBackend::new();
        let h = harness(&backend, "alice");
        let social = actions(&h);
        h.remote.set_connected(false);

        let outcome = social.add_reaction("p1", "👍").await.unwrap();
        assert!(matches!(outcome, ActionOutcome::Queued(_)));
        assert!(backend.write_log().is_empty());

        // Back online, but the queue still holds work: keep the order.
        h.remote.set_connected(true);
        let outcome = social.follow(&UserId::from("bob")).await.unwrap();
        assert!(matches!(outcome, ActionOutcome::Queued(_)));
        assert!(backend.write_log().is_empty());
    }

    #[tokio::test]
    async fn rejected_write_is_queued() {
        let backend = MemoryBackend::new();
        let h = harness(&backend, "alice");
        let social = actions(&h);
        backend.fail_next_write("posts").unwrap();

        let (post_id, outcome) = social.create_post(Some("c1"), "hello").await.unwrap();
        assert!(matches!(outcome, ActionOutcome::Queued(_)));
        assert_eq!(backend.value_at(&path::post(&post_id)), None);
    }

    #[tokio::test]
    async fn invalid_actions_never_touch_the_queue() {
        let backend = MemoryBackend::new();
        let h = harness(&backend, "alice");
        let social = actions(&h);
        h.remote.set_connected(false);

        assert!(social.follow(&UserId::from("alice")).await.is_err());
        assert!(social.add_reaction("p1", "a/b").await.is_err());
        assert!(social.create_post(None, "").await.is_err());
        assert!(social.queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn post_and_reactions_land_at_their_paths() {
        let backend = MemoryBackend::new();
        let h = harness(&backend, "alice");
        let social = actions(&h);

        let (post_id, _) = social.create_post(None, "first").await.unwrap();
        let post = backend.value_at(&path::post(&post_id)).unwrap();
        assert_eq!(post["author"], "alice");
        assert_eq!(post["body"], "first");

        social.add_reaction(&post_id, "🔥").await.unwrap();
        let reaction = format!("reactions/{post_id}/🔥/alice");
        assert_eq!(backend.value_at(&reaction), Some(json!(true)));
        social.remove_reaction(&post_id, "🔥").await.unwrap();
        assert_eq!(backend.value_at(&reaction), None);
    }
}
