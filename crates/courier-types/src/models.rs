use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ClientTempId, MessageId, RoomId, UserId};
use crate::payload::MessagePayload;

/// A durably persisted message. Immutable once created, except the `pinned`
/// and soft-`deleted` flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub payload: MessagePayload,
    pub pinned: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,

    /// Echoed back to the sender so its optimistic row can be reconciled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<ClientTempId>,
}

/// One emoji's reactions on a message, grouped for broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<UserId>,
}
