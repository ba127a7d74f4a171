//! Async facade over the local cache.
//!
//! SQLite calls are short and run under a `std::sync::Mutex` that is never
//! held across an `.await`. Documents the engine mutates are written with a
//! revision check; a conflicting write is retried with doubling backoff a
//! few times and then dropped with a warning.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use parley_shared::protocol::MessageRecord;
use parley_shared::{Conversation, MsgId, RoomId, SendState, UserId};
use parley_store::{CachedMessage, Database, Versioned};

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
}

#[derive(Clone)]
pub struct LocalCache {
    db: Arc<Mutex<Database>>,
    retry: RetryPolicy,
}

impl LocalCache {
    pub fn new(db: Database, retry: RetryPolicy) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            retry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run one synchronous store call.
    pub fn with_db<T>(&self, f: impl FnOnce(&Database) -> parley_store::Result<T>) -> Result<T> {
        let db = self.lock();
        f(&db).map_err(SyncError::from)
    }

    /// Read-modify-write one document. `f` receives the current value and
    /// returns the value to store, or `None` to leave it untouched.
    async fn read_modify_write<T, R, W, F>(
        &self,
        what: &'static str,
        key: &str,
        read: R,
        write: W,
        mut f: F,
    ) -> Result<Option<T>>
    where
        T: Send,
        R: Fn(&Database) -> parley_store::Result<Option<Versioned<T>>> + Send,
        W: Fn(&Database, &T, Option<i64>) -> parley_store::Result<i64> + Send,
        F: FnMut(Option<T>) -> Option<T> + Send,
    {
        let mut delay = self.retry.base;
        let mut attempt = 1;
        loop {
            let current = self.with_db(&read)?;
            let expected = current.as_ref().map(|v| v.revision);
            let Some(next) = f(current.map(|v| v.value)) else {
                return Ok(None);
            };

            match self.with_db(|db| write(db, &next, expected)) {
                Ok(_) => return Ok(Some(next)),
                Err(SyncError::Store(e)) if e.is_conflict() => {
                    if attempt >= self.retry.attempts {
                        warn!(what, key, attempts = attempt, "dropping cache write after repeated conflicts");
                        return Err(SyncError::CacheConflict {
                            what,
                            key: key.to_string(),
                        });
                    }
                    debug!(what, key, attempt, ?delay, "cache write conflict, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // -- Conversations --

    pub fn conversations(&self, owner: &UserId) -> Result<Vec<Conversation>> {
        self.with_db(|db| db.list_conversations(owner))
    }

    pub async fn update_conversation<F>(
        &self,
        owner: &UserId,
        room: &RoomId,
        f: F,
    ) -> Result<Option<Conversation>>
    where
        F: FnMut(Option<Conversation>) -> Option<Conversation> + Send,
    {
        self.read_modify_write(
            "conversation",
            room.as_str(),
            |db| db.get_conversation(owner, room),
            |db, value, expected| db.put_conversation(owner, value, expected),
            f,
        )
        .await
    }

    pub async fn save_conversation(&self, owner: &UserId, conversation: &Conversation) -> Result<()> {
        self.update_conversation(owner, &conversation.room_id, |_| Some(conversation.clone()))
            .await
            .map(|_| ())
    }

    pub fn delete_conversation(&self, owner: &UserId, room: &RoomId) -> Result<bool> {
        self.with_db(|db| db.delete_conversation(owner, room))
    }

    // -- Messages --

    pub fn message(&self, room: &RoomId, msg: &MsgId) -> Result<Option<CachedMessage>> {
        Ok(self
            .with_db(|db| db.get_message(room, msg))?
            .map(|v| v.value))
    }

    pub async fn update_message<F>(
        &self,
        room: &RoomId,
        msg: &MsgId,
        f: F,
    ) -> Result<Option<CachedMessage>>
    where
        F: FnMut(Option<CachedMessage>) -> Option<CachedMessage> + Send,
    {
        self.read_modify_write(
            "message",
            msg.as_str(),
            |db| db.get_message(room, msg),
            |db, value, expected| db.put_message(value, expected),
            f,
        )
        .await
    }

    pub async fn save_message(&self, message: &CachedMessage) -> Result<()> {
        let room = message.record.room_id.clone();
        let msg = message.record.msg_id.clone();
        self.update_message(&room, &msg, |_| Some(message.clone()))
            .await
            .map(|_| ())
    }

    /// Store a record received from the remote store. Its presence there
    /// means the send went through, whatever this device last recorded.
    pub async fn store_remote_message(&self, record: &MessageRecord) -> Result<()> {
        self.save_message(&CachedMessage::new(record.clone(), SendState::Sent))
            .await
    }

    pub fn message_page(&self, room: &RoomId, offset: usize, limit: usize) -> Result<Vec<CachedMessage>> {
        self.with_db(|db| db.messages_for_room(room, offset, limit))
    }

    pub fn all_messages(&self, room: &RoomId) -> Result<Vec<CachedMessage>> {
        self.with_db(|db| {
            let count = db.count_messages(room)?;
            db.messages_for_room(room, 0, count)
        })
    }

    pub fn delete_message(&self, room: &RoomId, msg: &MsgId) -> Result<bool> {
        self.with_db(|db| db.delete_message(room, msg))
    }

    // -- Cursors --

    pub fn cursor(&self, room: &RoomId) -> Result<Option<MsgId>> {
        self.with_db(|db| db.get_cursor(room))
    }

    pub fn advance_cursor(&self, room: &RoomId, key: &MsgId) -> Result<MsgId> {
        self.with_db(|db| db.advance_cursor(room, key))
    }
}
