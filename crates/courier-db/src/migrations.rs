use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS rooms (
            id          TEXT PRIMARY KEY,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Canonical membership. Owned by the conversation-management service;
        -- this subsystem reads it for authorization.
        CREATE TABLE IF NOT EXISTS room_members (
            room_id     TEXT NOT NULL REFERENCES rooms(id),
            user_id     TEXT NOT NULL,
            role        TEXT NOT NULL DEFAULT 'member',
            PRIMARY KEY (room_id, user_id)
        );

        -- INTEGER PRIMARY KEY gives a monotone id, which the bulk-read range
        -- (id <= up_to) depends on.
        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id         TEXT NOT NULL REFERENCES rooms(id),
            sender_id       TEXT NOT NULL,
            payload         TEXT NOT NULL,
            client_temp_id  TEXT,
            pinned          INTEGER NOT NULL DEFAULT 0,
            deleted         INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        -- Idempotency key: a replayed send resolves to the existing row.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_temp_id
            ON messages(client_temp_id) WHERE client_temp_id IS NOT NULL;

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room_id, id);

        CREATE TABLE IF NOT EXISTS reactions (
            message_id  INTEGER NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL,
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id, emoji)
        );

        CREATE TABLE IF NOT EXISTS read_receipts (
            message_id  INTEGER NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL,
            read_at     TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS last_seen (
            user_id     TEXT PRIMARY KEY,
            seen_at     TEXT NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
