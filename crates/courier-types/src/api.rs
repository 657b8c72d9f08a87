use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{ClientTempId, MessageId, UserId};
use crate::models::{Message, ReactionGroup};
use crate::payload::MessagePayload;

// -- JWT Claims --

/// JWT claims shared by the REST middleware and the WebSocket upgrade layer.
/// Canonical definition lives here to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

impl Claims {
    pub fn user_id(&self) -> UserId {
        UserId(self.sub)
    }
}

// -- Messages --

/// Body of the fallback send endpoint. Carries the same idempotency key the
/// primary transport would, so a retry over either path dedupes.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<ClientTempId>,
    pub payload: MessagePayload,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message: Message,

    /// True when the idempotency key matched an already-persisted message and
    /// nothing new was written.
    pub duplicate: bool,
}

// -- History --

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryMessage {
    #[serde(flatten)]
    pub message: Message,
    pub reactions: Vec<ReactionGroup>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,

    /// Cursor-based pagination: pass the smallest message id from the
    /// previous page to fetch older messages.
    pub before_id: Option<MessageId>,
}

fn default_limit() -> u32 {
    50
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            before_id: None,
        }
    }
}
