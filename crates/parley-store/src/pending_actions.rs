//! Offline action queue.
//!
//! One table for every action kind so that replay preserves the global
//! order in which the user performed them. `seq` is AUTOINCREMENT, so it is
//! never reused even after the head of the queue is removed.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use parley_shared::{ActionPayload, PendingAction};

use crate::database::{json_column, timestamp_column, Database};
use crate::error::{Result, StoreError};

const SELECT_COLUMNS: &str = "SELECT seq, payload, enqueued_at, retry_count FROM pending_actions";

impl Database {
    pub fn enqueue_action(&self, action: &ActionPayload) -> Result<PendingAction> {
        let enqueued_at = Utc::now();
        self.conn().execute(
            "INSERT INTO pending_actions (kind, scope, payload, enqueued_at, retry_count)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                action.kind(),
                action.scope(),
                serde_json::to_string(action)?,
                enqueued_at.to_rfc3339(),
            ],
        )?;
        Ok(PendingAction {
            seq: self.conn().last_insert_rowid(),
            action: action.clone(),
            enqueued_at,
            retry_count: 0,
        })
    }

    /// Head of the queue.
    pub fn peek_action(&self) -> Result<Option<PendingAction>> {
        let row = self
            .conn()
            .query_row(
                &format!("{SELECT_COLUMNS} ORDER BY seq ASC LIMIT 1"),
                [],
                row_to_action,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_actions(&self) -> Result<Vec<PendingAction>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("{SELECT_COLUMNS} ORDER BY seq ASC"))?;
        let rows = stmt.query_map([], row_to_action)?;

        let mut actions = Vec::new();
        for row in rows {
            actions.push(row?);
        }
        Ok(actions)
    }

    pub fn remove_action(&self, seq: i64) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM pending_actions WHERE seq = ?1", params![seq])?;
        Ok(affected > 0)
    }

    /// Increment the retry counter of `seq` and return its new value.
    pub fn bump_retry(&self, seq: i64) -> Result<u32> {
        self.conn()
            .query_row(
                "UPDATE pending_actions SET retry_count = retry_count + 1
                 WHERE seq = ?1
                 RETURNING retry_count",
                params![seq],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn count_actions(&self) -> Result<usize> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM pending_actions", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn row_to_action(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingAction> {
    Ok(PendingAction {
        seq: row.get(0)?,
        action: json_column(row, 1)?,
        enqueued_at: timestamp_column(row, 2)?,
        retry_count: row.get(3)?,
    })
}
