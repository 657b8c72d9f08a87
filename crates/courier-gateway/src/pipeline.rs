use courier_types::events::GatewayEvent;
use courier_types::{ClientTempId, ConnId, Message, MessagePayload, RoomId, UserId};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::storage::StoreOutcome;

/// Result of a send, after persistence succeeded.
#[derive(Debug)]
pub enum SendOutcome {
    /// A new durable message; it was broadcast to the room.
    Created(Message),

    /// A replayed `client_temp_id`; the existing record, nothing re-broadcast
    /// to the room.
    Duplicate(Message),
}

impl SendOutcome {
    pub fn message(&self) -> &Message {
        match self {
            SendOutcome::Created(m) | SendOutcome::Duplicate(m) => m,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, SendOutcome::Duplicate(_))
    }
}

impl Gateway {
    /// The send pipeline for a live connection: authenticate → canonical
    /// membership check → persist → fan out. On persistence failure the
    /// originating connection gets a targeted failure signal; nothing reaches
    /// the room.
    pub async fn send_message(
        &self,
        conn_id: ConnId,
        room_id: RoomId,
        client_temp_id: Option<ClientTempId>,
        payload: MessagePayload,
    ) -> Result<SendOutcome, GatewayError> {
        let user_id = self.resolve_user(conn_id).await?;

        let outcome = match self
            .send_from_user(user_id, room_id, client_temp_id.clone(), payload)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.notify_send_failure(conn_id, client_temp_id, &e).await;
                return Err(e);
            }
        };

        match &outcome {
            SendOutcome::Created(message) => {
                // The sender normally receives its copy via the room fanout;
                // if it sent before joining, echo directly so it can still
                // reconcile its optimistic row.
                if !self.rooms.members_of(room_id).await.contains(&conn_id) {
                    self.registry
                        .send_to_conn(
                            conn_id,
                            GatewayEvent::MessageCreate { message: message.clone() },
                        )
                        .await;
                }
            }
            SendOutcome::Duplicate(message) => {
                // Replay: the room already saw this message once. Ack the
                // origin only.
                debug!(
                    message_id = %message.id,
                    "duplicate send resolved to existing record"
                );
                self.registry
                    .send_to_conn(
                        conn_id,
                        GatewayEvent::MessageCreate { message: message.clone() },
                    )
                    .await;
            }
        }

        Ok(outcome)
    }

    /// Identity-level entry point, shared with the HTTP fallback channel
    /// (where the "origin" gets its answer in the response body instead of a
    /// targeted event). Persists first; broadcasts only after persistence,
    /// and only for newly created messages.
    pub async fn send_from_user(
        &self,
        user_id: UserId,
        room_id: RoomId,
        client_temp_id: Option<ClientTempId>,
        payload: MessagePayload,
    ) -> Result<SendOutcome, GatewayError> {
        validate_payload(&payload)?;
        self.require_member(room_id, user_id).await?;

        let stored = self
            .with_store(move |store| {
                store.create_message(room_id, user_id, &payload, client_temp_id.as_ref())
            })
            .await?;

        match stored {
            StoreOutcome::Created(message) => {
                self.broadcast_room(
                    room_id,
                    GatewayEvent::MessageCreate { message: message.clone() },
                )
                .await;
                Ok(SendOutcome::Created(message))
            }
            StoreOutcome::Duplicate(message) => Ok(SendOutcome::Duplicate(message)),
        }
    }

    async fn notify_send_failure(
        &self,
        conn_id: ConnId,
        client_temp_id: Option<ClientTempId>,
        err: &GatewayError,
    ) {
        warn!(%conn_id, "send failed: {err}");
        // Only storage failures are retryable; the outbox keeps the item and
        // tries again. Everything else (unauthorized, bad payload) is
        // terminal and gets a plain error instead of a retry signal.
        let event = match (client_temp_id, err) {
            (Some(client_temp_id), GatewayError::Persistence(_)) => {
                GatewayEvent::MessageSaveFailed { client_temp_id }
            }
            _ => GatewayEvent::Error { detail: err.to_string() },
        };
        self.registry.send_to_conn(conn_id, event).await;
    }
}

/// Structural checks beyond what serde's typed decode enforces. Shared by the
/// socket path and the HTTP fallback.
fn validate_payload(payload: &MessagePayload) -> Result<(), GatewayError> {
    match payload {
        MessagePayload::Text { body } | MessagePayload::Reply { body, .. }
            if body.trim().is_empty() =>
        {
            Err(GatewayError::InvalidPayload("empty message body".into()))
        }
        MessagePayload::Media { url, .. } if url.trim().is_empty() => {
            Err(GatewayError::InvalidPayload("empty media url".into()))
        }
        _ => Ok(()),
    }
}
