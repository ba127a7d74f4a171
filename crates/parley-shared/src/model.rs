//! Domain model published to the UI layer and persisted in the local cache.
//!
//! Timestamps are `DateTime<Utc>` here; the wire records in
//! [`crate::protocol`] carry epoch milliseconds instead.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{MsgId, RoomId, UserId};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    #[default]
    #[serde(alias = "individual", alias = "direct")]
    Private,
    Group,
    Community,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Private => "private",
            RoomKind::Group => "group",
            RoomKind::Community => "community",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" | "individual" | "direct" => Some(Self::Private),
            "group" => Some(Self::Group),
            "community" => Some(Self::Community),
            _ => None,
        }
    }
}

/// One entry of the user's conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub room_id: RoomId,
    pub kind: RoomKind,
    pub title: String,
    pub avatar: Option<String>,
    pub members: BTreeSet<UserId>,
    pub admin_ids: BTreeSet<UserId>,
    /// Decrypted preview of the last message.
    pub last_message: Option<String>,
    pub last_message_type: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Server-reconciled; only ever cleared to 0 by mark-read.
    pub unread_count: u32,
    pub is_archived: bool,
    pub is_pinned: bool,
    pub is_locked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Minimal record for a room that has no server metadata yet.
    pub fn synthesized(room_id: RoomId, kind: RoomKind, title: String) -> Self {
        let now = Utc::now();
        Self {
            room_id,
            kind,
            title,
            avatar: None,
            members: BTreeSet::new(),
            admin_ids: BTreeSet::new(),
            last_message: None,
            last_message_type: None,
            last_message_at: None,
            unread_count: 0,
            is_archived: false,
            is_pinned: false,
            is_locked: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Sort by `last_message_at` descending. `sort_by` is stable, so rooms with
/// equal timestamps keep their insertion order; rooms without messages sink.
pub fn sort_conversations(list: &mut [Conversation]) {
    list.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

/// A single delivered/read receipt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptEntry {
    pub user_id: UserId,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveredReceipts {
    /// True once every recipient has a delivered receipt.
    #[serde(default)]
    pub status: bool,
    #[serde(rename = "deliveredTo", default)]
    pub delivered_to: Vec<ReceiptEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadReceipts {
    /// True once every recipient has a read receipt.
    #[serde(default)]
    pub status: bool,
    #[serde(rename = "readBy", default)]
    pub read_by: Vec<ReceiptEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipts {
    #[serde(default)]
    pub delivered: DeliveredReceipts,
    #[serde(default)]
    pub read: ReadReceipts,
}

/// Soft-deletion markers. `users` goes over the wire as `{userId: true}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletedFor {
    #[serde(default)]
    pub everyone: bool,
    #[serde(default, with = "user_set")]
    pub users: BTreeSet<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub media_id: String,
    #[serde(rename = "type")]
    pub media_type: String,
    #[serde(default)]
    pub cdn_url: Option<String>,
    #[serde(default)]
    pub local_url: Option<String>,
}

impl Attachment {
    /// The URL a renderer should use, preferring the local file.
    pub fn display_url(&self) -> Option<&str> {
        self.local_url.as_deref().or(self.cdn_url.as_deref())
    }
}

/// Local-only delivery state of an outgoing message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SendState {
    Pending,
    #[default]
    Sent,
    /// Remote write failed; the message stays visible and retry-eligible.
    Failed,
}

/// A decrypted chat message as shown to the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub msg_id: MsgId,
    pub room_id: RoomId,
    pub sender: UserId,
    /// Plaintext (or the raw ciphertext when decryption failed).
    pub text: String,
    pub attachment: Option<Attachment>,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    pub receipts: Receipts,
    pub is_forwarded: bool,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_pinned: bool,
    pub deleted_for: DeletedFor,
    pub send_state: SendState,
}

impl Message {
    pub fn is_deleted_for(&self, user: &UserId) -> bool {
        self.deleted_for.everyone || self.deleted_for.users.contains(user)
    }
}

/// Sort by timestamp ascending; equal timestamps fall back to key order.
pub fn sort_messages(list: &mut [Message]) {
    list.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.msg_id.cmp(&b.msg_id))
    });
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// Ephemeral presence of one user, rebuilt from live subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_typing: bool,
}

// ---------------------------------------------------------------------------
// Contacts / profiles
// ---------------------------------------------------------------------------

/// A contact known locally (address book or earlier lookups).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub phone: Option<String>,
    pub avatar: Option<String>,
}

/// Profile returned by the profile capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub avatar: Option<String>,
}

// ---------------------------------------------------------------------------
// Pending actions
// ---------------------------------------------------------------------------

/// A state-changing action awaiting remote application.
///
/// Every variant is idempotent: it sets a final state rather than toggling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionPayload {
    Follow {
        target: UserId,
    },
    Unfollow {
        target: UserId,
    },
    CreatePost {
        post_id: String,
        channel_id: Option<String>,
        body: String,
        created_at: i64,
    },
    AddReaction {
        post_id: String,
        emoji: String,
    },
    RemoveReaction {
        post_id: String,
        emoji: String,
    },
    SendMessage {
        room_id: RoomId,
        msg_id: MsgId,
    },
}

impl ActionPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            ActionPayload::Follow { .. } => "follow",
            ActionPayload::Unfollow { .. } => "unfollow",
            ActionPayload::CreatePost { .. } => "create_post",
            ActionPayload::AddReaction { .. } => "add_reaction",
            ActionPayload::RemoveReaction { .. } => "remove_reaction",
            ActionPayload::SendMessage { .. } => "send_message",
        }
    }

    /// Room or channel the action is scoped to, if any.
    pub fn scope(&self) -> Option<String> {
        match self {
            ActionPayload::CreatePost { channel_id, .. } => channel_id.clone(),
            ActionPayload::SendMessage { room_id, .. } => Some(room_id.0.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAction {
    /// Queue position; strictly increasing in enqueue order.
    pub seq: i64,
    pub action: ActionPayload,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// `{userId: true}` on the wire; legacy records may carry a plain array.
mod user_set {
    use std::collections::{BTreeMap, BTreeSet};

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::types::UserId;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Map(BTreeMap<String, serde_json::Value>),
        List(Vec<String>),
    }

    pub fn serialize<S: Serializer>(set: &BTreeSet<UserId>, s: S) -> Result<S::Ok, S::Error> {
        let map: BTreeMap<&str, bool> = set.iter().map(|u| (u.as_str(), true)).collect();
        map.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeSet<UserId>, D::Error> {
        let repr = Option::<Repr>::deserialize(d)?;
        Ok(match repr {
            Some(Repr::Map(map)) => map
                .into_iter()
                .filter(|(_, v)| v.as_bool().unwrap_or(true))
                .map(|(k, _)| UserId(k))
                .collect(),
            Some(Repr::List(list)) => list.into_iter().map(UserId).collect(),
            None => BTreeSet::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn conv(room: &str, at: Option<i64>) -> Conversation {
        let mut c = Conversation::synthesized(RoomId::from(room), RoomKind::Private, room.into());
        c.last_message_at = at.map(|ms| Utc.timestamp_millis_opt(ms).unwrap());
        c
    }

    #[test]
    fn conversations_sort_descending_and_stable() {
        let mut list = vec![
            conv("a", Some(10)),
            conv("b", Some(30)),
            conv("c", Some(10)),
            conv("d", None),
            conv("e", Some(20)),
        ];
        sort_conversations(&mut list);
        let order: Vec<&str> = list.iter().map(|c| c.room_id.as_str()).collect();
        assert_eq!(order, vec!["b", "e", "a", "c", "d"]);
    }

    #[test]
    fn deleted_for_accepts_map_and_list() {
        let from_map: DeletedFor =
            serde_json::from_value(serde_json::json!({"everyone": false, "users": {"u1": true, "u2": false}}))
                .unwrap();
        assert_eq!(from_map.users.len(), 1);

        let from_list: DeletedFor =
            serde_json::from_value(serde_json::json!({"users": ["u1", "u2"]})).unwrap();
        assert_eq!(from_list.users.len(), 2);

        let encoded = serde_json::to_value(&from_list).unwrap();
        assert_eq!(encoded["users"]["u1"], serde_json::json!(true));
    }

    #[test]
    fn action_payload_is_internally_tagged() {
        let action = ActionPayload::Follow {
            target: UserId::from("bob"),
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "follow");
        assert_eq!(action.kind(), "follow");
        assert_eq!(action.scope(), None);
    }
}
