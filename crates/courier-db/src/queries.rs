use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::Database;
use crate::models::{MessageRow, ReactionRow};

/// Result of a message insert. A replayed `client_temp_id` resolves to the
/// already-persisted row instead of erroring — duplicate sends are success.
pub enum CreateOutcome {
    Created(MessageRow),
    Duplicate(MessageRow),
}

impl Database {
    // -- Rooms / membership --

    pub fn create_room(&self, room_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO rooms (id) VALUES (?1)",
                [room_id],
            )?;
            Ok(())
        })
    }

    pub fn add_member(&self, room_id: &str, user_id: &str, role: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO room_members (room_id, user_id, role) VALUES (?1, ?2, ?3)
                 ON CONFLICT(room_id, user_id) DO UPDATE SET role = excluded.role",
                (room_id, user_id, role),
            )?;
            Ok(())
        })
    }

    pub fn member_role(&self, room_id: &str, user_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT role FROM room_members WHERE room_id = ?1 AND user_id = ?2",
                (room_id, user_id),
                |row| row.get(0),
            )
            .optional()
        })
    }

    // -- Messages --

    /// Insert a message, honoring the idempotency key. The connection mutex
    /// serializes the lookup-then-insert, so a replay can never double-write.
    pub fn create_message(
        &self,
        room_id: &str,
        sender_id: &str,
        payload_json: &str,
        client_temp_id: Option<&str>,
    ) -> Result<CreateOutcome> {
        self.with_conn_mut(|conn| {
            if let Some(temp_id) = client_temp_id {
                if let Some(existing) = query_message_by_temp_id(conn, temp_id)? {
                    return Ok(CreateOutcome::Duplicate(existing));
                }
            }

            let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            conn.execute(
                "INSERT INTO messages (room_id, sender_id, payload, client_temp_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (room_id, sender_id, payload_json, client_temp_id, &created_at),
            )?;
            let id = conn.last_insert_rowid();

            Ok(CreateOutcome::Created(MessageRow {
                id,
                room_id: room_id.to_string(),
                sender_id: sender_id.to_string(),
                payload: payload_json.to_string(),
                client_temp_id: client_temp_id.map(str::to_string),
                pinned: false,
                deleted: false,
                created_at,
            }))
        })
    }

    pub fn message(&self, id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, room_id, sender_id, payload, client_temp_id, pinned, deleted, created_at
                 FROM messages WHERE id = ?1",
                [id],
                map_message_row,
            )
            .optional()
        })
    }

    pub fn get_messages(
        &self,
        room_id: &str,
        limit: u32,
        before_id: Option<i64>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, room_id, sender_id, payload, client_temp_id, pinned, deleted, created_at
                 FROM messages
                 WHERE room_id = ?1 AND deleted = 0 AND (?2 IS NULL OR id < ?2)
                 ORDER BY id DESC
                 LIMIT ?3",
            )?;

            let rows = stmt
                .query_map(rusqlite::params![room_id, before_id, limit], map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Set or clear the pin flag. Returns false when the message is missing
    /// or soft-deleted.
    pub fn set_pinned(&self, message_id: i64, pinned: bool) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET pinned = ?1 WHERE id = ?2 AND deleted = 0",
                (pinned, message_id),
            )?;
            Ok(changed > 0)
        })
    }

    // -- Reactions --

    /// Add a reaction. Set semantics: re-adding the same (user, emoji) is a
    /// no-op and returns false.
    pub fn add_reaction(&self, message_id: i64, user_id: &str, emoji: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            let changed = conn.execute(
                "INSERT OR IGNORE INTO reactions (message_id, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                (message_id, user_id, emoji, created_at),
            )?;
            Ok(changed > 0)
        })
    }

    pub fn remove_reaction(&self, message_id: i64, user_id: &str, emoji: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                (message_id, user_id, emoji),
            )?;
            Ok(changed > 0)
        })
    }

    pub fn reactions_for_message(&self, message_id: i64) -> Result<Vec<ReactionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, user_id, emoji FROM reactions
                 WHERE message_id = ?1
                 ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map([message_id], map_reaction_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Batch-fetch reactions for a set of message ids (history pages).
    pub fn reactions_for_messages(&self, message_ids: &[i64]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT message_id, user_id, emoji FROM reactions WHERE message_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), map_reaction_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Read receipts --

    /// Idempotent upsert: a later read overwrites `read_at` only if greater.
    /// Returns true when a row was inserted or advanced.
    pub fn mark_read(&self, message_id: i64, user_id: &str, at: DateTime<Utc>) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let at = at.to_rfc3339_opts(SecondsFormat::Millis, true);
            let changed = conn.execute(
                "INSERT INTO read_receipts (message_id, user_id, read_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(message_id, user_id) DO UPDATE SET read_at = excluded.read_at
                 WHERE excluded.read_at > read_receipts.read_at",
                (message_id, user_id, at),
            )?;
            Ok(changed > 0)
        })
    }

    /// Mark every not-yet-read message in the room with id <= `up_to` read,
    /// in one statement. Returns the number of new receipts.
    pub fn mark_read_batch(
        &self,
        room_id: &str,
        user_id: &str,
        up_to: i64,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        self.with_conn_mut(|conn| {
            let at = at.to_rfc3339_opts(SecondsFormat::Millis, true);
            let changed = conn.execute(
                "INSERT INTO read_receipts (message_id, user_id, read_at)
                 SELECT id, ?1, ?2 FROM messages
                 WHERE room_id = ?3 AND id <= ?4 AND deleted = 0
                 ON CONFLICT(message_id, user_id) DO NOTHING",
                (user_id, at, room_id, up_to),
            )?;
            Ok(changed as u64)
        })
    }

    // -- Presence --

    pub fn set_last_seen(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.with_conn_mut(|conn| {
            let at = at.to_rfc3339_opts(SecondsFormat::Millis, true);
            conn.execute(
                "INSERT INTO last_seen (user_id, seen_at) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET seen_at = excluded.seen_at",
                (user_id, at),
            )?;
            Ok(())
        })
    }
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        sender_id: row.get(2)?,
        payload: row.get(3)?,
        client_temp_id: row.get(4)?,
        pinned: row.get(5)?,
        deleted: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn map_reaction_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReactionRow> {
    Ok(ReactionRow {
        message_id: row.get(0)?,
        user_id: row.get(1)?,
        emoji: row.get(2)?,
    })
}

fn query_message_by_temp_id(conn: &Connection, temp_id: &str) -> Result<Option<MessageRow>> {
    conn.query_row(
        "SELECT id, room_id, sender_id, payload, client_temp_id, pinned, deleted, created_at
         FROM messages WHERE client_temp_id = ?1",
        [temp_id],
        map_message_row,
    )
    .optional()
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
