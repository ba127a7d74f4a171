//! Row types of the local cache that have no counterpart in
//! `parley_shared::model`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::protocol::MessageRecord;
use parley_shared::{MsgId, SendState};

/// A stored document together with the revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    /// Starts at 1 and increases by one on every successful write.
    pub revision: i64,
}

/// A cached message: the wire record (ciphertext) plus local send state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedMessage {
    pub record: MessageRecord,
    pub send_state: SendState,
}

impl CachedMessage {
    pub fn new(record: MessageRecord, send_state: SendState) -> Self {
        Self { record, send_state }
    }
}

/// Cached URLs for one message attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedAttachment {
    pub msg_id: MsgId,
    pub media_id: String,
    pub media_type: String,
    /// Last presigned download URL obtained from the media service.
    pub cdn_url: Option<String>,
    pub cdn_fetched_at: Option<DateTime<Utc>>,
    /// File already present on this device.
    pub local_url: Option<String>,
}

impl CachedAttachment {
    pub fn new(msg_id: MsgId, media_id: String, media_type: String) -> Self {
        Self {
            msg_id,
            media_id,
            media_type,
            cdn_url: None,
            cdn_fetched_at: None,
            local_url: None,
        }
    }
}

pub(crate) fn send_state_str(state: SendState) -> &'static str {
    match state {
        SendState::Pending => "pending",
        SendState::Sent => "sent",
        SendState::Failed => "failed",
    }
}

pub(crate) fn parse_send_state(raw: &str) -> SendState {
    match raw {
        "pending" => SendState::Pending,
        "failed" => SendState::Failed,
        _ => SendState::Sent,
    }
}
