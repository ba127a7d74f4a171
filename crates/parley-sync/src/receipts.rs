//! Delivered/read receipts, the active-room marker and unread counters.
//!
//! Receipt writes are best-effort: a failure is logged and swallowed, and
//! the next sync pass heals it. Unread counters are only ever incremented by
//! a send to a member who does not have the room active, and only ever reset
//! to an absolute value, never decremented.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use parley_remote::{path, ChildQuery, TransactionFn};
use parley_shared::protocol::{now_millis, ChatMeta, MessageRecord, PresenceWire};
use parley_shared::{Conversation, MsgId, RoomId, RoomKind, UserId};

use crate::context::Shared;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiptKind {
    Delivered,
    Read,
}

pub struct ReceiptEngine {
    shared: Arc<Shared>,
    /// Mirror of `activeRoom/{me}` as last written by this client.
    active: Mutex<Option<RoomId>>,
}

impl ReceiptEngine {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            active: Mutex::new(None),
        }
    }

    pub fn active_room(&self) -> Option<RoomId> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_active_local(&self, room: Option<RoomId>) {
        *self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = room;
    }

    // ---------------------------------------------------------------------
    // Active room
    // ---------------------------------------------------------------------

    /// Mark `room` as the one this user has open. The marker is cleared by
    /// the server if the connection drops.
    pub async fn set_active_room(&self, room: &RoomId) -> Result<()> {
        self.set_active_local(Some(room.clone()));
        self.write_active(room).await
    }

    async fn write_active(&self, room: &RoomId) -> Result<()> {
        let remote = &self.shared.remote;
        let marker = path::active_room(&self.shared.me);
        remote.on_disconnect_set(&marker, Value::Null).await?;
        remote.set(&marker, Value::String(room.to_string())).await?;
        debug!(room = %room, "active room set");
        Ok(())
    }

    /// Clear the marker if it still points at `room`.
    pub async fn clear_active_room(&self, room: &RoomId) -> Result<()> {
        if self.active_room().as_ref() != Some(room) {
            return Ok(());
        }
        self.set_active_local(None);
        self.shared
            .remote
            .remove(&path::active_room(&self.shared.me))
            .await?;
        debug!(room = %room, "active room cleared");
        Ok(())
    }

    /// Rewrite the marker after a reconnect; the disconnect rule removed it.
    pub async fn rearm_active_room(&self) -> Result<()> {
        match self.active_room() {
            Some(room) => self.write_active(&room).await,
            None => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Receipts
    // ---------------------------------------------------------------------

    /// Record that `user` received `msg`. Returns the committed record, or
    /// `None` if nothing changed or the write failed.
    pub async fn mark_delivered(
        &self,
        room: &RoomId,
        msg: &MsgId,
        user: &UserId,
        members: &BTreeSet<UserId>,
    ) -> Option<MessageRecord> {
        self.apply_receipt(room, msg, user, members, ReceiptKind::Delivered)
            .await
    }

    /// Record that `user` read `msg` (implies delivered).
    pub async fn mark_read(
        &self,
        room: &RoomId,
        msg: &MsgId,
        user: &UserId,
        members: &BTreeSet<UserId>,
    ) -> Option<MessageRecord> {
        self.apply_receipt(room, msg, user, members, ReceiptKind::Read)
            .await
    }

    async fn apply_receipt(
        &self,
        room: &RoomId,
        msg: &MsgId,
        user: &UserId,
        members: &BTreeSet<UserId>,
        kind: ReceiptKind,
    ) -> Option<MessageRecord> {
        let at = now_millis();
        let key = msg.to_string();
        let tx_room = room.clone();
        let tx_user = user.clone();
        let me = self.shared.me.clone();
        let members = members.clone();

        let apply: TransactionFn = Box::new(move |current| {
            let mut record = MessageRecord::from_value(&key, &tx_room, current?).ok()?;
            let members = effective_members(&members, &record.sender, &me);
            let changed = match kind {
                ReceiptKind::Delivered => record.apply_delivered(&tx_user, at, &members),
                ReceiptKind::Read => record.apply_read(&tx_user, at, &members),
            };
            if changed {
                record.to_value().ok()
            } else {
                None
            }
        });

        match self
            .shared
            .remote
            .transaction(&path::message(room, msg), apply)
            .await
        {
            Ok(Some(value)) => match MessageRecord::from_value(msg.as_str(), room, value) {
                Ok(record) => {
                    debug!(room = %room, msg = %msg, user = %user, ?kind, status = ?record.status, "receipt recorded");
                    Some(record)
                }
                Err(e) => {
                    warn!(room = %room, msg = %msg, error = %e, "committed receipt unreadable");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(room = %room, msg = %msg, user = %user, ?kind, error = %e, "receipt write failed");
                None
            }
        }
    }

    // ---------------------------------------------------------------------
    // Unread counters
    // ---------------------------------------------------------------------

    /// Set this user's unread counter for `room` to `count`.
    ///
    /// A reset to 0 only applies while `room` is the active room; a non-zero
    /// count ("mark unread") always applies. The metadata node is never
    /// created just to hold a counter. Returns whether a write happened.
    pub async fn set_unread_count(&self, room: &RoomId, count: u32) -> Result<bool> {
        if count == 0 && self.active_room().as_ref() != Some(room) {
            debug!(room = %room, "unread reset skipped, room not active");
            return Ok(false);
        }

        let apply: TransactionFn = Box::new(move |current| {
            let mut meta = ChatMeta::from_value(current?).ok()?;
            if meta.unread_count == count {
                return None;
            }
            meta.unread_count = count;
            meta.to_value().ok()
        });

        let committed = self
            .shared
            .remote
            .transaction(&path::user_room(&self.shared.me, room), apply)
            .await?;
        Ok(committed.is_some())
    }

    pub async fn mark_unread(&self, room: &RoomId) -> Result<bool> {
        self.set_unread_count(room, 1).await
    }

    /// Update every member's chat metadata after a send and record delivery
    /// for peers that are online right now. Returns the latest committed
    /// record if any receipt was written.
    pub(crate) async fn fan_out_send(
        &self,
        room: &RoomId,
        kind: RoomKind,
        record: &MessageRecord,
        members: &BTreeSet<UserId>,
    ) -> Option<MessageRecord> {
        let remote = &self.shared.remote;
        let members = effective_members(members, &record.sender, &self.shared.me);

        for member in &members {
            let active = if member == &record.sender {
                None
            } else {
                match remote.get(&path::active_room(member)).await {
                    Ok(value) => value.and_then(|v| v.as_str().map(RoomId::from)),
                    Err(e) => {
                        warn!(room = %room, member = %member, error = %e, "active room lookup failed");
                        None
                    }
                }
            };
            let increment = should_increment(member, &record.sender, active.as_ref(), room);

            let preview = record.text.clone();
            let at = record.timestamp;
            let msg_type = record.message_type();
            let apply: TransactionFn = Box::new(move |current| {
                apply_send_meta(current, kind, &preview, at, &msg_type, increment)
            });
            if let Err(e) = remote
                .transaction(&path::user_room(member, room), apply)
                .await
            {
                warn!(room = %room, member = %member, error = %e, "chat meta update failed");
            }
        }

        let mut latest = None;
        for member in members.iter().filter(|m| *m != &record.sender) {
            let online = match remote.get(&path::presence(member)).await {
                Ok(Some(value)) => PresenceWire::from_value(value)
                    .map(|p| p.is_online)
                    .unwrap_or(false),
                Ok(None) => false,
                Err(e) => {
                    warn!(member = %member, error = %e, "presence lookup failed");
                    false
                }
            };
            if online {
                if let Some(updated) = self
                    .mark_delivered(room, &record.msg_id, member, &members)
                    .await
                {
                    latest = Some(updated);
                }
            }
        }
        latest
    }

    /// Mark the newest unread messages of each room as delivered to this
    /// user. Returns the number of receipts written.
    pub async fn delivery_sweep(&self, conversations: &[Conversation]) -> usize {
        let me = &self.shared.me;
        let mut marked = 0;

        for conversation in conversations.iter().filter(|c| c.unread_count > 0) {
            let room = &conversation.room_id;
            let recent = match self
                .shared
                .remote
                .query_children(
                    &path::messages(room),
                    ChildQuery::last(conversation.unread_count as usize),
                )
                .await
            {
                Ok(items) => items,
                Err(e) => {
                    warn!(room = %room, error = %e, "delivery sweep skipped room");
                    continue;
                }
            };

            for (key, value) in recent {
                let Ok(record) = MessageRecord::from_value(&key, room, value) else {
                    continue;
                };
                if &record.sender == me || record.receipts.has_delivered(me) {
                    continue;
                }
                if self
                    .mark_delivered(room, &record.msg_id, me, &conversation.members)
                    .await
                    .is_some()
                {
                    marked += 1;
                }
            }
        }

        if marked > 0 {
            debug!(marked, "delivery sweep recorded receipts");
        }
        marked
    }
}

/// Members used for aggregation. An unknown roster falls back to the two
/// parties we know of, so an empty set never reads as "everyone has read".
fn effective_members(members: &BTreeSet<UserId>, sender: &UserId, me: &UserId) -> BTreeSet<UserId> {
    if members.is_empty() {
        BTreeSet::from([sender.clone(), me.clone()])
    } else {
        members.clone()
    }
}

/// A member's counter grows unless they sent the message or have the room
/// open.
fn should_increment(
    member: &UserId,
    sender: &UserId,
    member_active_room: Option<&RoomId>,
    room: &RoomId,
) -> bool {
    member != sender && member_active_room != Some(room)
}

fn apply_send_meta(
    current: Option<Value>,
    kind: RoomKind,
    preview: &str,
    at: i64,
    msg_type: &str,
    increment: bool,
) -> Option<Value> {
    let mut meta = match current {
        Some(value) => ChatMeta::from_value(value).unwrap_or_else(|e| {
            warn!(error = %e, "unreadable chat meta replaced, room flags reset");
            ChatMeta {
                kind,
                ..ChatMeta::default()
            }
        }),
        None => ChatMeta {
            kind,
            ..ChatMeta::default()
        },
    };
    meta.last_message = Some(preview.to_string());
    meta.last_message_at = Some(at);
    meta.last_message_type = Some(msg_type.to_string());
    if increment {
        meta.unread_count = meta.unread_count.saturating_add(1);
    }
    meta.to_value().ok()
}

#[cfg(test)]
mod tests {
    use parley_remote::MemoryBackend;
    use parley_shared::protocol::GroupRecord;
    use parley_shared::MessageStatus;
    use serde_json::json;

    use super::*;
    use crate::test_support::{harness, Harness};

    fn ids(list: &[&str]) -> BTreeSet<UserId> {
        list.iter().map(|s| UserId::from(*s)).collect()
    }

    #[test]
    fn increment_gating() {
        let room = RoomId::from("alicebob");
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        assert!(should_increment(&bob, &alice, None, &room));
        assert!(should_increment(&bob, &alice, Some(&RoomId::from("other")), &room));
        assert!(!should_increment(&bob, &alice, Some(&room), &room));
        assert!(!should_increment(&alice, &alice, None, &room));
    }

    #[test]
    fn send_meta_creates_and_increments() {
        let first = apply_send_meta(None, RoomKind::Private, "Y3Q=", 10, "text", true).unwrap();
        assert_eq!(first["unreadCount"], 1);
        assert_eq!(first["lastmessageAt"], 10);

        let second = apply_send_meta(Some(first), RoomKind::Private, "Y3Q=", 20, "image", true).unwrap();
        assert_eq!(second["unreadCount"], 2);
        assert_eq!(second["lastmessageType"], "image");

        let own = apply_send_meta(Some(second), RoomKind::Private, "Y3Q=", 30, "text", false).unwrap();
        assert_eq!(own["unreadCount"], 2);
    }

    async fn seed_message(backend: &MemoryBackend, room: &RoomId, id: &str, sender: &str) {
        let record = MessageRecord::new(MsgId::from(id), room.clone(), UserId::from(sender), "Y3Q=".into(), 1);
        backend
            .seed(&path::message(room, &record.msg_id), record.to_value().unwrap())
            .unwrap();
    }

    #[tokio::test]
    async fn receipts_are_idempotent_remotely() {
        let backend = MemoryBackend::new();
        let Harness { shared, .. } = harness(&backend, "bob");
        let engine = ReceiptEngine::new(shared);
        let room = RoomId::from("alicebob");
        let members = ids(&["alice", "bob"]);
        seed_message(&backend, &room, "m1", "alice").await;

        let bob = UserId::from("bob");
        let first = engine
            .mark_delivered(&room, &MsgId::from("m1"), &bob, &members)
            .await
            .unwrap();
        assert_eq!(first.status, MessageStatus::Delivered);
        assert!(engine
            .mark_delivered(&room, &MsgId::from("m1"), &bob, &members)
            .await
            .is_none());

        let read = engine
            .mark_read(&room, &MsgId::from("m1"), &bob, &members)
            .await
            .unwrap();
        assert_eq!(read.status, MessageStatus::Read);
        let snapshot = backend.value_at("messages/alicebob/m1");
        assert!(engine
            .mark_read(&room, &MsgId::from("m1"), &bob, &members)
            .await
            .is_none());
        assert_eq!(backend.value_at("messages/alicebob/m1"), snapshot);
    }

    #[tokio::test]
    async fn receipt_failure_is_swallowed() {
        let backend = MemoryBackend::new();
        let Harness { shared, remote, .. } = harness(&backend, "bob");
        let engine = ReceiptEngine::new(shared);
        let room = RoomId::from("alicebob");
        seed_message(&backend, &room, "m1", "alice").await;

        remote.set_connected(false);
        assert!(engine
            .mark_read(&room, &MsgId::from("m1"), &UserId::from("bob"), &ids(&["alice", "bob"]))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn unread_reset_requires_active_room_and_existing_node() {
        let backend = MemoryBackend::new();
        let Harness { shared, .. } = harness(&backend, "bob");
        let engine = ReceiptEngine::new(shared);
        let room = RoomId::from("alicebob");

        // No node yet: neither a reset nor mark-unread creates one.
        engine.set_active_room(&room).await.unwrap();
        assert!(!engine.set_unread_count(&room, 0).await.unwrap());
        assert!(!engine.mark_unread(&room).await.unwrap());
        assert_eq!(backend.value_at("userRooms/bob/alicebob"), None);

        backend
            .seed("userRooms/bob/alicebob", json!({"type": "private", "unreadCount": 3}))
            .unwrap();

        engine.clear_active_room(&room).await.unwrap();
        assert!(!engine.set_unread_count(&room, 0).await.unwrap());
        assert_eq!(backend.value_at("userRooms/bob/alicebob/unreadCount"), Some(json!(3)));

        engine.set_active_room(&room).await.unwrap();
        assert!(engine.set_unread_count(&room, 0).await.unwrap());
        assert_eq!(backend.value_at("userRooms/bob/alicebob/unreadCount"), Some(json!(0)));

        // Mark unread bypasses the active-room guard.
        engine.clear_active_room(&room).await.unwrap();
        assert!(engine.mark_unread(&room).await.unwrap());
        assert_eq!(backend.value_at("userRooms/bob/alicebob/unreadCount"), Some(json!(1)));
    }

    #[tokio::test]
    async fn active_marker_is_cleared_on_disconnect() {
        let backend = MemoryBackend::new();
        let Harness { shared, remote, .. } = harness(&backend, "bob");
        let engine = ReceiptEngine::new(shared);
        let room = RoomId::from("alicebob");

        engine.set_active_room(&room).await.unwrap();
        assert_eq!(backend.value_at("activeRoom/bob"), Some(json!("alicebob")));

        remote.set_connected(false);
        assert_eq!(backend.value_at("activeRoom/bob"), None);
        assert_eq!(engine.active_room(), Some(room));

        remote.set_connected(true);
        engine.rearm_active_room().await.unwrap();
        assert_eq!(backend.value_at("activeRoom/bob"), Some(json!("alicebob")));
    }

    #[tokio::test]
    async fn fan_out_gates_unread_per_member() {
        let backend = MemoryBackend::new();
        let Harness { shared, .. } = harness(&backend, "alice");
        let engine = ReceiptEngine::new(shared);
        let room = RoomId::from("g1");
        let members = ids(&["alice", "bob", "carol"]);

        // Carol has the room open and is online; Bob is neither.
        backend.seed("activeRoom/carol", json!("g1")).unwrap();
        backend.seed("presence/carol", json!({"isOnline": true})).unwrap();
        seed_message(&backend, &room, "m1", "alice").await;
        let record = MessageRecord::from_value("m1", &room, backend.value_at("messages/g1/m1").unwrap()).unwrap();

        let updated = engine
            .fan_out_send(&room, RoomKind::Group, &record, &members)
            .await
            .unwrap();

        assert_eq!(backend.value_at("userRooms/bob/g1/unreadCount"), Some(json!(1)));
        assert_eq!(backend.value_at("userRooms/carol/g1/unreadCount"), Some(json!(0)));
        assert_eq!(backend.value_at("userRooms/alice/g1/unreadCount"), Some(json!(0)));
        assert!(updated.receipts.has_delivered(&UserId::from("carol")));
        assert!(!updated.receipts.has_delivered(&UserId::from("bob")));
        assert_eq!(updated.status, MessageStatus::Sent);
    }

    #[test]
    fn unreadable_meta_is_rebuilt() {
        let meta = apply_send_meta(Some(json!("garbage")), RoomKind::Group, "Y3Q=", 10, "text", true).unwrap();
        assert_eq!(meta["type"], "group");
        assert_eq!(meta["unreadCount"], 1);
        assert_eq!(meta["lastmessage"], "Y3Q=");
    }

    #[tokio::test]
    async fn group_read_needs_every_active_member() {
        let backend = MemoryBackend::new();
        let Harness { shared, .. } = harness(&backend, "bob");
        let engine = ReceiptEngine::new(shared);
        let room = RoomId::from("g1");
        let roster = GroupRecord::from_value(json!({
            "title": "g",
            "members": {
                "alice": {"isActive": true},
                "bob": {"username": "bob", "isActive": true},
                "carol": {"phone": "+1555"},
                "dave": {"isActive": false},
            },
        }))
        .unwrap();
        let members = roster.member_ids();
        assert_eq!(members, ids(&["alice", "bob", "carol"]));
        seed_message(&backend, &room, "m1", "alice").await;
        let m1 = MsgId::from("m1");

        let after_bob = engine
            .mark_read(&room, &m1, &UserId::from("bob"), &members)
            .await
            .unwrap();
        assert_ne!(after_bob.status, MessageStatus::Read);

        let after_carol = engine
            .mark_read(&room, &m1, &UserId::from("carol"), &members)
            .await
            .unwrap();
        assert_eq!(after_carol.status, MessageStatus::Read);
        assert_eq!(backend.value_at("messages/g1/m1/status"), Some(json!("read")));
    }
}
