//! Database row types — these map directly to SQLite rows.
//! Distinct from the courier-types wire models to keep the DB layer independent.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use courier_types::{ClientTempId, Message, MessageId, MessagePayload, RoomId, UserId};
use uuid::Uuid;

pub struct MessageRow {
    pub id: i64,
    pub room_id: String,
    pub sender_id: String,
    pub payload: String,
    pub client_temp_id: Option<String>,
    pub pinned: bool,
    pub deleted: bool,
    pub created_at: String,
}

pub struct ReactionRow {
    pub message_id: i64,
    pub user_id: String,
    pub emoji: String,
}

impl MessageRow {
    /// Convert a row into the wire model, failing on corrupt columns rather
    /// than papering over them.
    pub fn into_message(self) -> Result<Message> {
        let payload: MessagePayload = serde_json::from_str(&self.payload)
            .with_context(|| format!("corrupt payload on message {}", self.id))?;

        Ok(Message {
            id: MessageId(self.id),
            room_id: RoomId(parse_uuid(&self.room_id, "room_id", self.id)?),
            sender_id: UserId(parse_uuid(&self.sender_id, "sender_id", self.id)?),
            payload,
            pinned: self.pinned,
            deleted: self.deleted,
            created_at: parse_timestamp(&self.created_at, self.id)?,
            client_temp_id: self.client_temp_id.map(ClientTempId),
        })
    }
}

fn parse_uuid(raw: &str, column: &str, message_id: i64) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("corrupt {} '{}' on message {}", column, raw, message_id))
}

fn parse_timestamp(raw: &str, message_id: i64) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("corrupt created_at '{}' on message {}", raw, message_id))
}
