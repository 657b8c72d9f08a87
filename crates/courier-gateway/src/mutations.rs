use chrono::Utc;
use courier_types::events::GatewayEvent;
use courier_types::{ConnId, Message, MessageId, RoomId};
use tracing::debug;

use crate::error::GatewayError;
use crate::gateway::Gateway;

/// Message-state mutations: reactions, pins, read receipts. Every operation
/// follows authenticate → authorize → mutate → re-read the full resulting
/// state → broadcast that full state to the room. Broadcasting full state
/// (not deltas) keeps interleaved mutations from racing on clients. A failure
/// at any step surfaces to the caller only; the room sees nothing partial.
impl Gateway {
    pub async fn add_reaction(
        &self,
        conn_id: ConnId,
        message_id: MessageId,
        emoji: String,
    ) -> Result<(), GatewayError> {
        self.mutate_reaction(conn_id, message_id, emoji, true).await
    }

    pub async fn remove_reaction(
        &self,
        conn_id: ConnId,
        message_id: MessageId,
        emoji: String,
    ) -> Result<(), GatewayError> {
        self.mutate_reaction(conn_id, message_id, emoji, false).await
    }

    async fn mutate_reaction(
        &self,
        conn_id: ConnId,
        message_id: MessageId,
        emoji: String,
        add: bool,
    ) -> Result<(), GatewayError> {
        let (message, user_id) = self.authorize_target(conn_id, message_id).await?;

        let reactions = self
            .with_store(move |store| {
                if add {
                    store.add_reaction(message_id, user_id, &emoji)?;
                } else {
                    store.remove_reaction(message_id, user_id, &emoji)?;
                }
                store.reactions(message_id)
            })
            .await?;

        self.broadcast_room(
            message.room_id,
            GatewayEvent::ReactionsChanged {
                room_id: message.room_id,
                message_id,
                reactions,
            },
        )
        .await;
        Ok(())
    }

    pub async fn set_pinned(
        &self,
        conn_id: ConnId,
        message_id: MessageId,
        pinned: bool,
    ) -> Result<(), GatewayError> {
        let (message, user_id) = self.authorize_target(conn_id, message_id).await?;

        // Pinning is restricted to elevated room roles.
        let role = self.require_member(message.room_id, user_id).await?;
        if !role.can_pin() {
            return Err(GatewayError::Unauthorized);
        }

        let existed = self
            .with_store(move |store| store.set_pinned(message_id, pinned))
            .await?;
        if !existed {
            return Err(GatewayError::UnknownMessage(message_id));
        }

        self.broadcast_room(
            message.room_id,
            GatewayEvent::PinChanged {
                room_id: message.room_id,
                message_id,
                pinned,
                by: user_id,
            },
        )
        .await;
        Ok(())
    }

    /// Per-message read receipt. The receipt only ever advances; a stale
    /// timestamp is a no-op and broadcasts nothing.
    pub async fn mark_read(
        &self,
        conn_id: ConnId,
        message_id: MessageId,
    ) -> Result<(), GatewayError> {
        let (message, user_id) = self.authorize_target(conn_id, message_id).await?;
        let read_at = Utc::now();

        let advanced = self
            .with_store(move |store| store.mark_read(message_id, user_id, read_at))
            .await?;

        if advanced {
            self.broadcast_room(
                message.room_id,
                GatewayEvent::ReadProgress {
                    room_id: message.room_id,
                    user_id,
                    up_to: message_id,
                    read_at,
                },
            )
            .await;
        }
        Ok(())
    }

    /// Bulk-read on conversation open: one batch write covering every unread
    /// message with id <= `up_to`, one summary broadcast. This is what keeps
    /// unread counters converging in a single round trip instead of one
    /// `mark_read` per message.
    pub async fn open_room(
        &self,
        conn_id: ConnId,
        room_id: RoomId,
        up_to: MessageId,
    ) -> Result<u64, GatewayError> {
        let user_id = self.resolve_user(conn_id).await?;
        self.open_room_for_user(user_id, room_id, up_to).await
    }

    /// Identity-level bulk read, shared with the HTTP fallback channel.
    pub async fn open_room_for_user(
        &self,
        user_id: courier_types::UserId,
        room_id: RoomId,
        up_to: MessageId,
    ) -> Result<u64, GatewayError> {
        self.require_member(room_id, user_id).await?;
        let read_at = Utc::now();

        let newly_read = self
            .with_store(move |store| store.mark_read_batch(room_id, user_id, up_to, read_at))
            .await?;

        if newly_read > 0 {
            self.broadcast_room(
                room_id,
                GatewayEvent::ReadProgress {
                    room_id,
                    user_id,
                    up_to,
                    read_at,
                },
            )
            .await;
        } else {
            debug!(%room_id, %user_id, %up_to, "open_room: nothing unread");
        }

        Ok(newly_read)
    }

    /// Resolve the caller and the target message, and check canonical room
    /// membership for the message's room.
    async fn authorize_target(
        &self,
        conn_id: ConnId,
        message_id: MessageId,
    ) -> Result<(Message, courier_types::UserId), GatewayError> {
        let user_id = self.resolve_user(conn_id).await?;

        let message = self
            .with_store(move |store| store.message(message_id))
            .await?
            .ok_or(GatewayError::UnknownMessage(message_id))?;

        self.require_member(message.room_id, user_id).await?;
        Ok((message, user_id))
    }
}
