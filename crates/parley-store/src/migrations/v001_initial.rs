//! v001 -- Initial schema creation.
//!
//! Creates the `messages` and `friend_edges` tables.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    text         TEXT NOT NULL,
    sender_id    TEXT NOT NULL,               -- UUID of the author
    room_id      TEXT,                        -- set for group messages
    recipient_id TEXT,                        -- set for direct messages
    is_unsend    INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    is_deleted   INTEGER NOT NULL DEFAULT 0,
    is_seen      INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,               -- RFC-3339, UTC, microseconds

    CHECK ((room_id IS NULL) <> (recipient_id IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_messages_room_ts
    ON messages(room_id, created_at);

CREATE INDEX IF NOT EXISTS idx_messages_pair_ts
    ON messages(sender_id, recipient_id, created_at);

-- ----------------------------------------------------------------
-- Friend edges
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS friend_edges (
    id          TEXT PRIMARY KEY NOT NULL,    -- UUID v4
    sender_id   TEXT NOT NULL,                -- requester
    receiver_id TEXT NOT NULL,
    user_lo     TEXT NOT NULL,                -- min(sender_id, receiver_id)
    user_hi     TEXT NOT NULL,                -- max(sender_id, receiver_id)
    status      TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'accepted')),
    created_at  TEXT NOT NULL,

    UNIQUE (user_lo, user_hi)
);

CREATE INDEX IF NOT EXISTS idx_friend_edges_receiver
    ON friend_edges(receiver_id, status);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
