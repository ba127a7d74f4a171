//! Wire records stored in the remote real-time store.
//!
//! Records written by older clients use several names for the same field
//! (`lastMessageAt`, `last_message_at`, `timestamp`, ...). Every record is
//! passed through [`canonicalize`] at ingestion so the rest of the engine
//! only ever sees one canonical name per concept.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::TEXT_MESSAGE_TYPE;
use crate::error::WireError;
use crate::model::{
    Attachment, DeletedFor, Message, MessageStatus, PresenceRecord, Receipts, RoomKind, SendState,
};
use crate::types::{MsgId, RoomId, UserId};

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// Epoch milliseconds from a number, a numeric string or an RFC 3339 string.
fn timestamp_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse::<i64>().ok().or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis())
        }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Normalization helpers
// ---------------------------------------------------------------------------

/// Move the first non-null value among `canonical` and its `legacy` names
/// into `canonical`, dropping every legacy key.
pub fn canonicalize(map: &mut Map<String, Value>, canonical: &str, legacy: &[&str]) {
    let mut found = map.remove(canonical).filter(|v| !v.is_null());
    for name in legacy {
        let value = map.remove(*name);
        if found.is_none() {
            found = value.filter(|v| !v.is_null());
        }
    }
    if let Some(value) = found {
        map.insert(canonical.to_string(), value);
    }
}

fn canonicalize_timestamp(map: &mut Map<String, Value>, canonical: &str, legacy: &[&str]) {
    canonicalize(map, canonical, legacy);
    if let Some(raw) = map.remove(canonical) {
        if let Some(ms) = timestamp_millis(&raw) {
            map.insert(canonical.to_string(), Value::from(ms));
        }
    }
}

/// Counters written by buggy clients can be negative or fractional.
fn canonicalize_count(map: &mut Map<String, Value>, canonical: &str, legacy: &[&str]) {
    canonicalize(map, canonical, legacy);
    let count = map
        .remove(canonical)
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .unwrap_or(0)
        .clamp(0, u32::MAX as i64);
    map.insert(canonical.to_string(), Value::from(count));
}

fn into_object(value: Value, what: &'static str) -> Result<Map<String, Value>, WireError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(WireError::NotAnObject(what)),
    }
}

fn decode<T: for<'de> Deserialize<'de>>(
    map: Map<String, Value>,
    what: &'static str,
) -> Result<T, WireError> {
    serde_json::from_value(Value::Object(map)).map_err(|source| WireError::Malformed { what, source })
}

fn encode<T: Serialize>(record: &T, what: &'static str) -> Result<Value, WireError> {
    serde_json::to_value(record).map_err(|source| WireError::Encode { what, source })
}

// ---------------------------------------------------------------------------
// userRooms/{userId}/{roomId}
// ---------------------------------------------------------------------------

/// Per-user index entry for one room.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMeta {
    #[serde(rename = "type", default)]
    pub kind: RoomKind,
    /// Ciphertext of the last message preview.
    #[serde(rename = "lastmessage", default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(rename = "lastmessageAt", default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<i64>,
    #[serde(rename = "lastmessageType", default, skip_serializing_if = "Option::is_none")]
    pub last_message_type: Option<String>,
    #[serde(rename = "unreadCount", default)]
    pub unread_count: u32,
    #[serde(rename = "isArchived", default)]
    pub is_archived: bool,
    #[serde(rename = "isPinned", default)]
    pub is_pinned: bool,
    #[serde(rename = "isLocked", default)]
    pub is_locked: bool,
}

impl ChatMeta {
    pub fn from_value(value: Value) -> Result<Self, WireError> {
        let mut map = into_object(value, "chat meta")?;
        canonicalize(&mut map, "type", &["roomType", "chatType"]);
        canonicalize(&mut map, "lastmessage", &["lastMessage", "last_message"]);
        canonicalize_timestamp(
            &mut map,
            "lastmessageAt",
            &["lastMessageAt", "last_message_at", "lastMessageTime", "timestamp"],
        );
        canonicalize(
            &mut map,
            "lastmessageType",
            &["lastMessageType", "last_message_type"],
        );
        canonicalize_count(&mut map, "unreadCount", &["unread_count", "unread"]);
        canonicalize(&mut map, "isArchived", &["archived", "is_archived"]);
        canonicalize(&mut map, "isPinned", &["pinned", "is_pinned"]);
        canonicalize(&mut map, "isLocked", &["locked", "is_locked"]);
        decode(map, "chat meta")
    }

    pub fn to_value(&self) -> Result<Value, WireError> {
        encode(self, "chat meta")
    }
}

// ---------------------------------------------------------------------------
// rooms_group/{roomId}
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMember {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(rename = "isActive", default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Shared record of a group or community room.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupRecord {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<RoomKind>,
    #[serde(default)]
    pub members: BTreeMap<String, GroupMember>,
    #[serde(rename = "adminIds", default)]
    pub admin_ids: Vec<UserId>,
}

impl GroupRecord {
    pub fn from_value(value: Value) -> Result<Self, WireError> {
        let mut map = into_object(value, "group record")?;
        canonicalize(&mut map, "title", &["name", "groupName", "communityName"]);
        canonicalize(&mut map, "avatar", &["photo", "image", "groupImage", "avatarUrl"]);
        canonicalize(&mut map, "adminIds", &["admins", "admin_ids"]);

        // Older rosters are a plain list of ids.
        match map.remove("members") {
            Some(Value::Array(ids)) => {
                let members: Map<String, Value> = ids
                    .into_iter()
                    .filter_map(|id| id.as_str().map(|s| (s.to_string(), Value::Object(Map::new()))))
                    .collect();
                map.insert("members".into(), Value::Object(members));
            }
            Some(other) => {
                map.insert("members".into(), other);
            }
            None => {}
        }
        // Admin sets may be stored as `{userId: true}`.
        match map.remove("adminIds") {
            Some(Value::Object(admins)) => {
                let ids: Vec<Value> = admins
                    .into_iter()
                    .filter(|(_, v)| v.as_bool().unwrap_or(true))
                    .map(|(k, _)| Value::String(k))
                    .collect();
                map.insert("adminIds".into(), Value::Array(ids));
            }
            Some(other) => {
                map.insert("adminIds".into(), other);
            }
            None => {}
        }
        decode(map, "group record")
    }

    pub fn to_value(&self) -> Result<Value, WireError> {
        encode(self, "group record")
    }

    /// Active members of the roster.
    pub fn member_ids(&self) -> BTreeSet<UserId> {
        self.members
            .iter()
            .filter(|(_, m)| m.is_active)
            .map(|(id, _)| UserId(id.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// presence/{userId}
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceWire {
    #[serde(rename = "isOnline", default)]
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<i64>,
}

impl PresenceWire {
    pub fn online(at: i64) -> Self {
        Self {
            is_online: true,
            last_changed: Some(at),
        }
    }

    pub fn offline(at: i64) -> Self {
        Self {
            is_online: false,
            last_changed: Some(at),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, WireError> {
        let mut map = into_object(value, "presence")?;
        if !map.contains_key("isOnline") {
            if let Some(Value::String(state)) = map.get("state") {
                let online = state == "online";
                map.insert("isOnline".into(), Value::Bool(online));
            }
        }
        map.remove("state");
        canonicalize(&mut map, "isOnline", &["online", "is_online"]);
        canonicalize_timestamp(
            &mut map,
            "last_changed",
            &["lastSeen", "last_seen", "lastChanged", "lastOnline", "timestamp"],
        );
        decode(map, "presence")
    }

    pub fn to_value(&self) -> Result<Value, WireError> {
        encode(self, "presence")
    }

    pub fn into_record(self, user_id: UserId) -> PresenceRecord {
        PresenceRecord {
            user_id,
            is_online: self.is_online,
            last_seen: self.last_changed.and_then(millis_to_datetime),
            is_typing: false,
        }
    }
}

// ---------------------------------------------------------------------------
// messages/{roomId}/{msgId}
// ---------------------------------------------------------------------------

/// A message as stored remotely and in the local cache: `text` is ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub msg_id: MsgId,
    pub room_id: RoomId,
    pub sender: UserId,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub receipts: Receipts,
    #[serde(default)]
    pub is_forwarded: bool,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<i64>,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub deleted_for: DeletedFor,
}

impl MessageRecord {
    pub fn new(
        msg_id: MsgId,
        room_id: RoomId,
        sender: UserId,
        ciphertext: String,
        timestamp: i64,
    ) -> Self {
        Self {
            msg_id,
            room_id,
            sender,
            text: ciphertext,
            attachment: None,
            timestamp,
            status: MessageStatus::Sent,
            receipts: Receipts::default(),
            is_forwarded: false,
            is_edited: false,
            edited_at: None,
            is_pinned: false,
            deleted_for: DeletedFor::default(),
        }
    }

    /// Normalize a record read from `messages/{room}/{key}`. Missing ids fall
    /// back to the path the record was found at.
    pub fn from_value(key: &str, room: &RoomId, value: Value) -> Result<Self, WireError> {
        let mut map = into_object(value, "message")?;
        canonicalize(&mut map, "msgId", &["id", "messageId", "msg_id"]);
        canonicalize(&mut map, "roomId", &["room_id", "chatId"]);
        canonicalize(&mut map, "sender", &["senderId", "sender_id", "from", "uid"]);
        canonicalize(&mut map, "text", &["message", "body", "content"]);
        canonicalize_timestamp(
            &mut map,
            "timestamp",
            &["createdAt", "created_at", "sentAt", "time", "ts"],
        );
        canonicalize_timestamp(&mut map, "editedAt", &["edited_at", "updatedAt"]);
        canonicalize(&mut map, "deletedFor", &["deleted_for"]);
        map.entry("msgId").or_insert_with(|| Value::String(key.to_string()));
        map.entry("roomId").or_insert_with(|| Value::String(room.0.clone()));
        decode(map, "message")
    }

    pub fn to_value(&self) -> Result<Value, WireError> {
        encode(self, "message")
    }

    /// Value stored as `lastmessageType` in chat metadata.
    pub fn message_type(&self) -> String {
        self.attachment
            .as_ref()
            .map(|a| a.media_type.clone())
            .unwrap_or_else(|| TEXT_MESSAGE_TYPE.to_string())
    }

    /// Build the displayable message from this record and its decrypted text.
    pub fn into_message(self, plaintext: String, send_state: SendState) -> Message {
        Message {
            timestamp: millis_to_datetime(self.timestamp).unwrap_or_default(),
            edited_at: self.edited_at.and_then(millis_to_datetime),
            msg_id: self.msg_id,
            room_id: self.room_id,
            sender: self.sender,
            text: plaintext,
            attachment: self.attachment,
            status: self.status,
            receipts: self.receipts,
            is_forwarded: self.is_forwarded,
            is_edited: self.is_edited,
            is_pinned: self.is_pinned,
            deleted_for: self.deleted_for,
            send_state,
        }
    }
}

/// Body of `posts/{postId}` written by the create-post action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    pub author: UserId,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub created_at: i64,
}

impl PostRecord {
    pub fn to_value(&self) -> Result<Value, WireError> {
        encode(self, "post")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_meta_accepts_legacy_names() {
        let meta = ChatMeta::from_value(json!({
            "type": "group",
            "lastMessage": "c2VjcmV0",
            "last_message_at": "2024-01-01T00:00:00Z",
            "unread": -3,
            "pinned": true,
        }))
        .unwrap();

        assert_eq!(meta.kind, RoomKind::Group);
        assert_eq!(meta.last_message.as_deref(), Some("c2VjcmV0"));
        assert_eq!(meta.last_message_at, Some(1_704_067_200_000));
        assert_eq!(meta.unread_count, 0);
        assert!(meta.is_pinned);
    }

    #[test]
    fn canonical_name_wins_over_legacy() {
        let meta = ChatMeta::from_value(json!({
            "lastmessageAt": 20,
            "timestamp": 10,
        }))
        .unwrap();
        assert_eq!(meta.last_message_at, Some(20));
    }

    #[test]
    fn chat_meta_serializes_canonical_names() {
        let meta = ChatMeta {
            kind: RoomKind::Private,
            last_message_at: Some(5),
            unread_count: 2,
            ..ChatMeta::default()
        };
        let value = meta.to_value().unwrap();
        assert_eq!(value["type"], "private");
        assert_eq!(value["lastmessageAt"], 5);
        assert_eq!(value["unreadCount"], 2);
    }

    #[test]
    fn presence_normalizes_timestamp_variants() {
        for key in ["last_changed", "lastSeen", "last_seen", "lastChanged", "timestamp"] {
            let mut raw = Map::new();
            raw.insert("isOnline".into(), Value::Bool(false));
            raw.insert(key.into(), Value::from(42));
            let presence = PresenceWire::from_value(Value::Object(raw)).unwrap();
            assert_eq!(presence.last_changed, Some(42), "field {key}");
        }
    }

    #[test]
    fn presence_tolerates_several_timestamp_fields_at_once() {
        let presence = PresenceWire::from_value(json!({
            "state": "online",
            "lastSeen": 7,
            "last_seen": 9,
        }))
        .unwrap();
        assert!(presence.is_online);
        assert_eq!(presence.last_changed, Some(7));
    }

    #[test]
    fn group_record_accepts_list_roster_and_admin_map() {
        let record = GroupRecord::from_value(json!({
            "name": "climbers",
            "members": ["u1", "u2"],
            "adminIds": {"u1": true},
        }))
        .unwrap();

        assert_eq!(record.title, "climbers");
        assert_eq!(record.member_ids().len(), 2);
        assert_eq!(record.admin_ids, vec![UserId::from("u1")]);
    }

    #[test]
    fn inactive_members_are_not_counted() {
        let record = GroupRecord::from_value(json!({
            "title": "t",
            "members": {
                "u1": {"username": "one", "isActive": true},
                "u2": {"username": "two", "isActive": false},
            },
        }))
        .unwrap();
        assert_eq!(record.member_ids(), BTreeSet::from([UserId::from("u1")]));
    }

    #[test]
    fn roster_and_admins_keep_every_shape() {
        let mapped = GroupRecord::from_value(json!({
            "title": "t",
            "members": {"u1": {"isActive": true}, "u2": {}},
            "adminIds": ["u1"],
        }))
        .unwrap();
        assert_eq!(
            mapped.member_ids(),
            BTreeSet::from([UserId::from("u1"), UserId::from("u2")])
        );
        assert_eq!(mapped.admin_ids, vec![UserId::from("u1")]);

        let listed = GroupRecord::from_value(json!({
            "members": ["u3"],
            "admins": {"u3": true, "u4": false},
        }))
        .unwrap();
        assert_eq!(listed.member_ids(), BTreeSet::from([UserId::from("u3")]));
        assert_eq!(listed.admin_ids, vec![UserId::from("u3")]);
    }

    #[test]
    fn message_record_falls_back_to_path_key() {
        let room = RoomId::from("alicebob");
        let record = MessageRecord::from_value(
            "0001",
            &room,
            json!({"senderId": "alice", "message": "Y2lwaGVy", "createdAt": 100}),
        )
        .unwrap();

        assert_eq!(record.msg_id, MsgId::from("0001"));
        assert_eq!(record.room_id, room);
        assert_eq!(record.sender, UserId::from("alice"));
        assert_eq!(record.text, "Y2lwaGVy");
        assert_eq!(record.timestamp, 100);
        assert_eq!(record.status, MessageStatus::Sent);
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(matches!(
            ChatMeta::from_value(json!(3)),
            Err(WireError::NotAnObject(_))
        ));
    }
}
