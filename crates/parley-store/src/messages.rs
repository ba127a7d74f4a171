use rusqlite::{params, OptionalExtension};

use parley_shared::{MsgId, RoomId};

use crate::database::{json_column, Database};
use crate::error::{Result, StoreError};
use crate::models::{parse_send_state, send_state_str, CachedMessage, Versioned};

impl Database {
    pub fn get_message(&self, room: &RoomId, msg: &MsgId) -> Result<Option<Versioned<CachedMessage>>> {
        let row = self
            .conn()
            .query_row(
                "SELECT body, send_state, revision FROM messages
                 WHERE room_id = ?1 AND msg_id = ?2",
                params![room.as_str(), msg.as_str()],
                row_to_versioned,
            )
            .optional()?;
        Ok(row)
    }

    /// Write a message based on `expected` revision (`None` = must not exist
    /// yet). Returns the new revision.
    pub fn put_message(&self, message: &CachedMessage, expected: Option<i64>) -> Result<i64> {
        let record = &message.record;
        let body = serde_json::to_string(record)?;
        let state = send_state_str(message.send_state);

        let affected = match expected {
            None => self.conn().execute(
                "INSERT INTO messages (room_id, msg_id, sender, timestamp, body, send_state, revision)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)
                 ON CONFLICT(room_id, msg_id) DO NOTHING",
                params![
                    record.room_id.as_str(),
                    record.msg_id.as_str(),
                    record.sender.as_str(),
                    record.timestamp,
                    body,
                    state,
                ],
            )?,
            Some(revision) => self.conn().execute(
                "UPDATE messages
                 SET sender = ?3, timestamp = ?4, body = ?5, send_state = ?6,
                     revision = revision + 1
                 WHERE room_id = ?1 AND msg_id = ?2 AND revision = ?7",
                params![
                    record.room_id.as_str(),
                    record.msg_id.as_str(),
                    record.sender.as_str(),
                    record.timestamp,
                    body,
                    state,
                    revision,
                ],
            )?,
        };

        if affected == 0 {
            return Err(StoreError::Conflict {
                table: "messages",
                key: record.msg_id.to_string(),
            });
        }
        Ok(expected.map_or(1, |r| r + 1))
    }

    /// One page of a room's messages, newest first.
    pub fn messages_for_room(
        &self,
        room: &RoomId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CachedMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT body, send_state, revision
             FROM messages
             WHERE room_id = ?1
             ORDER BY timestamp DESC, msg_id DESC
             LIMIT ?2 OFFSET ?3",
        )?;

        let rows = stmt.query_map(
            params![room.as_str(), limit as i64, offset as i64],
            row_to_versioned,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?.value);
        }
        Ok(messages)
    }

    pub fn count_messages(&self, room: &RoomId) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE room_id = ?1",
            params![room.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn delete_message(&self, room: &RoomId, msg: &MsgId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE room_id = ?1 AND msg_id = ?2",
            params![room.as_str(), msg.as_str()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_versioned(row: &rusqlite::Row<'_>) -> rusqlite::Result<Versioned<CachedMessage>> {
    let send_state: String = row.get(1)?;
    Ok(Versioned {
        value: CachedMessage {
            record: json_column(row, 0)?,
            send_state: parse_send_state(&send_state),
        },
        revision: row.get(2)?,
    })
}

#[cfg(test)]
mod tests {
    use parley_shared::protocol::MessageRecord;
    use parley_shared::{SendState, UserId};

    use super::*;

    fn cached(room: &str, id: &str, ts: i64) -> CachedMessage {
        CachedMessage::new(
            MessageRecord::new(
                MsgId::from(id),
                RoomId::from(room),
                UserId::from("alice"),
                "Y3Q=".into(),
                ts,
            ),
            SendState::Sent,
        )
    }

    #[test]
    fn pages_are_newest_first() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..25 {
            db.put_message(&cached("r1", &format!("m{i:02}"), i), None)
                .unwrap();
        }
        db.put_message(&cached("r2", "other", 100), None).unwrap();

        let first = db.messages_for_room(&RoomId::from("r1"), 0, 20).unwrap();
        assert_eq!(first.len(), 20);
        assert_eq!(first[0].record.msg_id, MsgId::from("m24"));

        let second = db.messages_for_room(&RoomId::from("r1"), 20, 20).unwrap();
        assert_eq!(second.len(), 5);
        assert_eq!(second[4].record.msg_id, MsgId::from("m00"));
        assert_eq!(db.count_messages(&RoomId::from("r1")).unwrap(), 25);
    }

    #[test]
    fn send_state_and_revision_survive() {
        let db = Database::open_in_memory().unwrap();
        let mut msg = cached("r1", "m1", 1);
        msg.send_state = SendState::Failed;
        db.put_message(&msg, None).unwrap();

        let stored = db
            .get_message(&RoomId::from("r1"), &MsgId::from("m1"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.value.send_state, SendState::Failed);
        assert_eq!(stored.revision, 1);

        msg.send_state = SendState::Sent;
        assert_eq!(db.put_message(&msg, Some(1)).unwrap(), 2);
        assert!(db.put_message(&msg, Some(1)).unwrap_err().is_conflict());
    }
}
