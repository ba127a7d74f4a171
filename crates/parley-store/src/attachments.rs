use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use parley_shared::MsgId;

use crate::database::{optional_timestamp_column, Database};
use crate::error::Result;
use crate::models::CachedAttachment;

impl Database {
    pub fn get_attachment(&self, msg: &MsgId) -> Result<Option<CachedAttachment>> {
        let row = self
            .conn()
            .query_row(
                "SELECT msg_id, media_id, media_type, cdn_url, cdn_fetched_at, local_url
                 FROM attachments WHERE msg_id = ?1",
                params![msg.as_str()],
                row_to_attachment,
            )
            .optional()?;
        Ok(row)
    }

    pub fn upsert_attachment(&self, attachment: &CachedAttachment) -> Result<()> {
        self.conn().execute(
            "INSERT INTO attachments (msg_id, media_id, media_type, cdn_url, cdn_fetched_at, local_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(msg_id) DO UPDATE SET
                 media_id = excluded.media_id,
                 media_type = excluded.media_type,
                 cdn_url = excluded.cdn_url,
                 cdn_fetched_at = excluded.cdn_fetched_at,
                 local_url = excluded.local_url",
            params![
                attachment.msg_id.as_str(),
                attachment.media_id,
                attachment.media_type,
                attachment.cdn_url,
                attachment.cdn_fetched_at.map(|at| at.to_rfc3339()),
                attachment.local_url,
            ],
        )?;
        Ok(())
    }

    /// Remember a freshly fetched presigned URL, keeping any local file.
    pub fn set_attachment_cdn_url(
        &self,
        msg: &MsgId,
        media_id: &str,
        media_type: &str,
        url: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO attachments (msg_id, media_id, media_type, cdn_url, cdn_fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(msg_id) DO UPDATE SET
                 cdn_url = excluded.cdn_url,
                 cdn_fetched_at = excluded.cdn_fetched_at",
            params![msg.as_str(), media_id, media_type, url, fetched_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_attachment_local_url(
        &self,
        msg: &MsgId,
        media_id: &str,
        media_type: &str,
        local_url: &str,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO attachments (msg_id, media_id, media_type, local_url)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(msg_id) DO UPDATE SET local_url = excluded.local_url",
            params![msg.as_str(), media_id, media_type, local_url],
        )?;
        Ok(())
    }

    pub fn delete_attachment(&self, msg: &MsgId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM attachments WHERE msg_id = ?1",
            params![msg.as_str()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_attachment(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedAttachment> {
    let msg_id: String = row.get(0)?;
    Ok(CachedAttachment {
        msg_id: MsgId(msg_id),
        media_id: row.get(1)?,
        media_type: row.get(2)?,
        cdn_url: row.get(3)?,
        cdn_fetched_at: optional_timestamp_column(row, 4)?,
        local_url: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdn_and_local_urls_merge() {
        let db = Database::open_in_memory().unwrap();
        let msg = MsgId::from("m1");

        db.set_attachment_cdn_url(&msg, "media-1", "image", "https://cdn/x", Utc::now())
            .unwrap();
        db.set_attachment_local_url(&msg, "media-1", "image", "file:///tmp/x")
            .unwrap();

        let stored = db.get_attachment(&msg).unwrap().unwrap();
        assert_eq!(stored.cdn_url.as_deref(), Some("https://cdn/x"));
        assert_eq!(stored.local_url.as_deref(), Some("file:///tmp/x"));
        assert!(stored.cdn_fetched_at.is_some());
    }

    #[test]
    fn missing_attachment_is_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_attachment(&MsgId::from("nope")).unwrap().is_none());
        assert!(!db.delete_attachment(&MsgId::from("nope")).unwrap());
    }
}
