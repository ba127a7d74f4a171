//! v001 -- Initial schema creation.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations, one row per (owner, room)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    owner_id        TEXT NOT NULL,
    room_id         TEXT NOT NULL,
    kind            TEXT NOT NULL,              -- private | group | community
    body            TEXT NOT NULL,              -- JSON Conversation
    last_message_at INTEGER,                    -- epoch ms, ordering only
    revision        INTEGER NOT NULL DEFAULT 1,

    PRIMARY KEY (owner_id, room_id)
);

CREATE INDEX IF NOT EXISTS idx_conversations_owner_last
    ON conversations(owner_id, last_message_at DESC);

-- ----------------------------------------------------------------
-- Messages (text column of body is ciphertext)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    room_id    TEXT NOT NULL,
    msg_id     TEXT NOT NULL,
    sender     TEXT NOT NULL,
    timestamp  INTEGER NOT NULL,                -- epoch ms
    body       TEXT NOT NULL,                   -- JSON MessageRecord
    send_state TEXT NOT NULL DEFAULT 'sent',    -- pending | sent | failed
    revision   INTEGER NOT NULL DEFAULT 1,

    PRIMARY KEY (room_id, msg_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_room_ts
    ON messages(room_id, timestamp DESC);

-- ----------------------------------------------------------------
-- Attachment URL cache
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS attachments (
    msg_id         TEXT PRIMARY KEY NOT NULL,
    media_id       TEXT NOT NULL,
    media_type     TEXT NOT NULL,
    cdn_url        TEXT,
    cdn_fetched_at TEXT,                        -- RFC-3339
    local_url      TEXT
);

-- ----------------------------------------------------------------
-- Locally known contacts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contacts (
    user_id      TEXT PRIMARY KEY NOT NULL,
    display_name TEXT,
    phone        TEXT,
    avatar       TEXT
);

-- ----------------------------------------------------------------
-- Catch-up cursors: largest message key processed per room
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS room_cursors (
    room_id    TEXT PRIMARY KEY NOT NULL,
    last_key   TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Offline action queue
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS pending_actions (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    kind        TEXT NOT NULL,
    scope       TEXT,                           -- room or channel id
    payload     TEXT NOT NULL,                  -- JSON ActionPayload
    enqueued_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
