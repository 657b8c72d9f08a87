use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use courier_types::{
    ClientTempId, Message, MessageId, MessagePayload, ReactionGroup, RoomId, RoomRole, UserId,
};

use courier_db::{CreateOutcome, Database};

/// Result of persisting a send.
pub enum StoreOutcome {
    Created(Message),

    /// The idempotency key matched an existing record; nothing was written.
    Duplicate(Message),
}

/// The persistence collaborator as the gateway sees it. Methods are blocking;
/// callers run them on a blocking task. Tests substitute an in-memory fake.
pub trait Storage: Send + Sync + 'static {
    fn create_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        payload: &MessagePayload,
        client_temp_id: Option<&ClientTempId>,
    ) -> Result<StoreOutcome>;

    fn message(&self, id: MessageId) -> Result<Option<Message>>;

    fn member_role(&self, room_id: RoomId, user_id: UserId) -> Result<Option<RoomRole>>;

    /// Returns false when the reaction already existed (set semantics).
    fn add_reaction(&self, id: MessageId, user_id: UserId, emoji: &str) -> Result<bool>;

    fn remove_reaction(&self, id: MessageId, user_id: UserId, emoji: &str) -> Result<bool>;

    /// Full grouped reaction state for one message.
    fn reactions(&self, id: MessageId) -> Result<Vec<ReactionGroup>>;

    /// Returns false when the message does not exist.
    fn set_pinned(&self, id: MessageId, pinned: bool) -> Result<bool>;

    /// Returns true when the receipt was inserted or advanced.
    fn mark_read(&self, id: MessageId, user_id: UserId, at: DateTime<Utc>) -> Result<bool>;

    /// Returns the number of newly written receipts.
    fn mark_read_batch(
        &self,
        room_id: RoomId,
        user_id: UserId,
        up_to: MessageId,
        at: DateTime<Utc>,
    ) -> Result<u64>;

    fn set_last_seen(&self, user_id: UserId, at: DateTime<Utc>) -> Result<()>;
}

impl Storage for Database {
    fn create_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        payload: &MessagePayload,
        client_temp_id: Option<&ClientTempId>,
    ) -> Result<StoreOutcome> {
        let payload_json = serde_json::to_string(payload)?;
        let outcome = Database::create_message(
            self,
            &room_id.to_string(),
            &sender_id.to_string(),
            &payload_json,
            client_temp_id.map(|t| t.as_str()),
        )?;

        Ok(match outcome {
            CreateOutcome::Created(row) => StoreOutcome::Created(row.into_message()?),
            CreateOutcome::Duplicate(row) => StoreOutcome::Duplicate(row.into_message()?),
        })
    }

    fn message(&self, id: MessageId) -> Result<Option<Message>> {
        Database::message(self, id.0)?
            .map(|row| row.into_message())
            .transpose()
    }

    fn member_role(&self, room_id: RoomId, user_id: UserId) -> Result<Option<RoomRole>> {
        let raw = Database::member_role(self, &room_id.to_string(), &user_id.to_string())?;
        Ok(raw.as_deref().and_then(RoomRole::parse))
    }

    fn add_reaction(&self, id: MessageId, user_id: UserId, emoji: &str) -> Result<bool> {
        Database::add_reaction(self, id.0, &user_id.to_string(), emoji)
    }

    fn remove_reaction(&self, id: MessageId, user_id: UserId, emoji: &str) -> Result<bool> {
        Database::remove_reaction(self, id.0, &user_id.to_string(), emoji)
    }

    fn reactions(&self, id: MessageId) -> Result<Vec<ReactionGroup>> {
        let rows = Database::reactions_for_message(self, id.0)?;
        Ok(group_reactions(rows))
    }

    fn set_pinned(&self, id: MessageId, pinned: bool) -> Result<bool> {
        Database::set_pinned(self, id.0, pinned)
    }

    fn mark_read(&self, id: MessageId, user_id: UserId, at: DateTime<Utc>) -> Result<bool> {
        Database::mark_read(self, id.0, &user_id.to_string(), at)
    }

    fn mark_read_batch(
        &self,
        room_id: RoomId,
        user_id: UserId,
        up_to: MessageId,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        Database::mark_read_batch(self, &room_id.to_string(), &user_id.to_string(), up_to.0, at)
    }

    fn set_last_seen(&self, user_id: UserId, at: DateTime<Utc>) -> Result<()> {
        Database::set_last_seen(self, &user_id.to_string(), at)
    }
}

/// Group raw reaction rows into per-emoji buckets for broadcast.
pub fn group_reactions(rows: Vec<courier_db::models::ReactionRow>) -> Vec<ReactionGroup> {
    let mut by_emoji: BTreeMap<String, Vec<UserId>> = BTreeMap::new();
    for row in rows {
        if let Ok(uid) = row.user_id.parse() {
            by_emoji.entry(row.emoji).or_default().push(UserId(uid));
        }
    }

    by_emoji
        .into_iter()
        .map(|(emoji, user_ids)| ReactionGroup {
            emoji,
            count: user_ids.len(),
            user_ids,
        })
        .collect()
}
