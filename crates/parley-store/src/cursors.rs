//! Catch-up cursors.
//!
//! A cursor is the largest message key already processed for a room. It is
//! stored apart from the message rows so it survives an empty or reordered
//! in-memory list, and it only ever moves forward.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use parley_shared::{MsgId, RoomId};

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn get_cursor(&self, room: &RoomId) -> Result<Option<MsgId>> {
        let key: Option<String> = self
            .conn()
            .query_row(
                "SELECT last_key FROM room_cursors WHERE room_id = ?1",
                params![room.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key.map(MsgId))
    }

    /// Move the cursor to `key` unless it is already further. Returns the
    /// stored cursor.
    pub fn advance_cursor(&self, room: &RoomId, key: &MsgId) -> Result<MsgId> {
        self.conn().execute(
            "INSERT INTO room_cursors (room_id, last_key, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(room_id) DO UPDATE SET
                 last_key = MAX(last_key, excluded.last_key),
                 updated_at = excluded.updated_at",
            params![room.as_str(), key.as_str(), Utc::now().to_rfc3339()],
        )?;
        let stored: String = self.conn().query_row(
            "SELECT last_key FROM room_cursors WHERE room_id = ?1",
            params![room.as_str()],
            |row| row.get(0),
        )?;
        Ok(MsgId(stored))
    }

    pub fn clear_cursor(&self, room: &RoomId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM room_cursors WHERE room_id = ?1",
            params![room.as_str()],
        )?;
        Ok(affected > 0)
    }
}
