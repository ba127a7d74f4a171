use rusqlite::{params, OptionalExtension};

use parley_shared::{Conversation, RoomId, UserId};

use crate::database::{json_column, Database};
use crate::error::{Result, StoreError};
use crate::models::Versioned;

impl Database {
    pub fn get_conversation(
        &self,
        owner: &UserId,
        room: &RoomId,
    ) -> Result<Option<Versioned<Conversation>>> {
        let row = self
            .conn()
            .query_row(
                "SELECT body, revision FROM conversations
                 WHERE owner_id = ?1 AND room_id = ?2",
                params![owner.as_str(), room.as_str()],
                |row| {
                    Ok(Versioned {
                        value: json_column(row, 0)?,
                        revision: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// All conversations of `owner`, newest activity first. Rows without a
    /// last message come last; ties keep insertion order.
    pub fn list_conversations(&self, owner: &UserId) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT body FROM conversations
             WHERE owner_id = ?1
             ORDER BY last_message_at DESC, rowid ASC",
        )?;

        let rows = stmt.query_map(params![owner.as_str()], |row| json_column(row, 0))?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    /// Write a conversation based on `expected` revision (`None` = must not
    /// exist yet). Returns the new revision.
    pub fn put_conversation(
        &self,
        owner: &UserId,
        conversation: &Conversation,
        expected: Option<i64>,
    ) -> Result<i64> {
        let body = serde_json::to_string(conversation)?;
        let last_at = conversation.last_message_at.map(|at| at.timestamp_millis());

        let affected = match expected {
            None => self.conn().execute(
                "INSERT INTO conversations (owner_id, room_id, kind, body, last_message_at, revision)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)
                 ON CONFLICT(owner_id, room_id) DO NOTHING",
                params![
                    owner.as_str(),
                    conversation.room_id.as_str(),
                    conversation.kind.as_str(),
                    body,
                    last_at,
                ],
            )?,
            Some(revision) => self.conn().execute(
                "UPDATE conversations
                 SET kind = ?3, body = ?4, last_message_at = ?5, revision = revision + 1
                 WHERE owner_id = ?1 AND room_id = ?2 AND revision = ?6",
                params![
                    owner.as_str(),
                    conversation.room_id.as_str(),
                    conversation.kind.as_str(),
                    body,
                    last_at,
                    revision,
                ],
            )?,
        };

        if affected == 0 {
            return Err(StoreError::Conflict {
                table: "conversations",
                key: conversation.room_id.to_string(),
            });
        }
        Ok(expected.map_or(1, |r| r + 1))
    }

    pub fn delete_conversation(&self, owner: &UserId, room: &RoomId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM conversations WHERE owner_id = ?1 AND room_id = ?2",
            params![owner.as_str(), room.as_str()],
        )?;
        Ok(affected > 0)
    }
}
