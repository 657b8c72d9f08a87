use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ClientTempId, MessageId, RoomId, UserId};
use crate::models::{Message, ReactionGroup};
use crate::payload::MessagePayload;

/// Events sent from the gateway to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the connection is authenticated and registered.
    Ready { user_id: UserId, username: String },

    /// A message was durably persisted. Always carries the server-assigned id;
    /// `client_temp_id` inside the message is the sender's reconciliation key.
    MessageCreate { message: Message },

    /// Persistence failed for the sender's optimistic message. Targeted to the
    /// originating connection only, never broadcast.
    MessageSaveFailed { client_temp_id: ClientTempId },

    /// Full reaction state for a message after a mutation. Full state, not a
    /// delta, so interleaved mutations cannot race on the client.
    ReactionsChanged {
        room_id: RoomId,
        message_id: MessageId,
        reactions: Vec<ReactionGroup>,
    },

    PinChanged {
        room_id: RoomId,
        message_id: MessageId,
        pinned: bool,
        by: UserId,
    },

    /// A user's read position advanced. One event per `open_room` batch or
    /// per-message `mark_read`.
    ReadProgress {
        room_id: RoomId,
        user_id: UserId,
        up_to: MessageId,
        read_at: DateTime<Utc>,
    },

    MemberJoined { room_id: RoomId, user_id: UserId },

    MemberLeft { room_id: RoomId, user_id: UserId },

    /// A user's first connection came online or last connection went offline.
    PresenceUpdate { user_id: UserId, online: bool },

    /// Generic failure targeted at the caller (no temp id to correlate).
    Error { detail: String },
}

impl GatewayEvent {
    /// Room this event is scoped to. `None` means connection-global.
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            Self::MessageCreate { message } => Some(message.room_id),
            Self::ReactionsChanged { room_id, .. } => Some(*room_id),
            Self::PinChanged { room_id, .. } => Some(*room_id),
            Self::ReadProgress { room_id, .. } => Some(*room_id),
            Self::MemberJoined { room_id, .. } => Some(*room_id),
            Self::MemberLeft { room_id, .. } => Some(*room_id),
            _ => None,
        }
    }
}

/// Commands sent from clients to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Join a room's live fanout. Idempotent; replayed on every reconnect.
    Join { room_id: RoomId },

    Leave { room_id: RoomId },

    Send {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_temp_id: Option<ClientTempId>,
        payload: MessagePayload,
    },

    AddReaction { message_id: MessageId, emoji: String },

    RemoveReaction { message_id: MessageId, emoji: String },

    Pin { message_id: MessageId },

    Unpin { message_id: MessageId },

    MarkRead { message_id: MessageId },

    /// Mark everything up to `up_to` read in one round trip. Used when a
    /// conversation is opened, instead of one `MarkRead` per message.
    OpenRoom { room_id: RoomId, up_to: MessageId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn command_wire_shape_is_tagged() {
        let cmd = GatewayCommand::Join {
            room_id: RoomId(Uuid::nil()),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "Join");
        assert!(json["data"]["room_id"].is_string());
    }

    #[test]
    fn send_without_temp_id_omits_field() {
        let cmd = GatewayCommand::Send {
            room_id: RoomId(Uuid::nil()),
            client_temp_id: None,
            payload: MessagePayload::Text { body: "hi".into() },
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert!(json["data"].get("client_temp_id").is_none());
    }

    #[test]
    fn room_scoping() {
        let ev = GatewayEvent::PresenceUpdate {
            user_id: UserId(Uuid::nil()),
            online: true,
        };
        assert_eq!(ev.room_id(), None);

        let room = RoomId(Uuid::new_v4());
        let ev = GatewayEvent::MemberJoined {
            room_id: room,
            user_id: UserId(Uuid::nil()),
        };
        assert_eq!(ev.room_id(), Some(room));
    }
}
