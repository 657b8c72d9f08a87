use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use courier_types::events::GatewayEvent;
use courier_types::{ConnId, RoomId, UserId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomTracker;
use crate::storage::Storage;

/// The server-side core: connection registry, live room tracker, and the
/// persistence collaborator, bundled behind one cloneable handle.
#[derive(Clone)]
pub struct Gateway {
    pub registry: ConnectionRegistry,
    pub rooms: RoomTracker,
    store: Arc<dyn Storage>,
}

impl Gateway {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            rooms: RoomTracker::new(),
            store,
        }
    }

    /// Register an authenticated connection and announce presence if this is
    /// the user's first device online.
    pub async fn connect(
        &self,
        conn_id: ConnId,
        user_id: UserId,
        tx: mpsc::UnboundedSender<GatewayEvent>,
    ) {
        let came_online = self.registry.register(conn_id, user_id, tx).await;
        if came_online {
            self.registry
                .send_to_all(GatewayEvent::PresenceUpdate { user_id, online: true })
                .await;
        }
    }

    /// Tear down a connection: leave all rooms (emitting MemberLeft), then
    /// unregister. The offline last-seen write is best-effort on a blocking
    /// task and never delays disconnect handling.
    pub async fn disconnect(&self, conn_id: ConnId) {
        let user_id = self.registry.user_of(conn_id).await;

        for room_id in self.rooms.leave_all(conn_id).await {
            if let Some(user_id) = user_id {
                self.broadcast_room(room_id, GatewayEvent::MemberLeft { room_id, user_id })
                    .await;
            }
        }

        let Some(unregistered) = self.registry.unregister(conn_id).await else {
            return;
        };

        if unregistered.went_offline {
            let user_id = unregistered.user_id;
            self.registry
                .send_to_all(GatewayEvent::PresenceUpdate { user_id, online: false })
                .await;

            let store = self.store.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = store.set_last_seen(user_id, Utc::now()) {
                    warn!(%user_id, "failed to persist last-seen: {e:#}");
                }
            });
        }
    }

    /// Join the live fanout for a room. Requires canonical membership.
    /// Idempotent: rejoining an already-joined room is a no-op.
    pub async fn join_room(&self, conn_id: ConnId, room_id: RoomId) -> Result<(), GatewayError> {
        let user_id = self.resolve_user(conn_id).await?;
        self.require_member(room_id, user_id).await?;

        let newly = self.rooms.join(room_id, conn_id).await;
        if newly {
            self.broadcast_room(room_id, GatewayEvent::MemberJoined { room_id, user_id })
                .await;
        } else {
            debug!(%conn_id, %room_id, "rejoin of already-joined room ignored");
        }
        Ok(())
    }

    pub async fn leave_room(&self, conn_id: ConnId, room_id: RoomId) -> Result<(), GatewayError> {
        let user_id = self.resolve_user(conn_id).await?;
        if self.rooms.leave(room_id, conn_id).await {
            self.broadcast_room(room_id, GatewayEvent::MemberLeft { room_id, user_id })
                .await;
        }
        Ok(())
    }

    /// Fan an event out to every connection currently joined to the room.
    pub async fn broadcast_room(&self, room_id: RoomId, event: GatewayEvent) {
        for conn_id in self.rooms.members_of(room_id).await {
            self.registry.send_to_conn(conn_id, event.clone()).await;
        }
    }

    pub(crate) async fn resolve_user(&self, conn_id: ConnId) -> Result<UserId, GatewayError> {
        self.registry
            .user_of(conn_id)
            .await
            .ok_or(GatewayError::Unauthorized)
    }

    /// Canonical membership check against storage, independent of the live
    /// room tracker.
    pub(crate) async fn require_member(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<courier_types::RoomRole, GatewayError> {
        self.with_store(move |store| store.member_role(room_id, user_id))
            .await?
            .ok_or(GatewayError::Unauthorized)
    }

    /// Run a storage call on a blocking task (rusqlite must stay off the
    /// async runtime).
    pub(crate) async fn with_store<T, F>(&self, f: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Storage) -> anyhow::Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| GatewayError::Persistence(anyhow!("storage task join: {e}")))?
            .map_err(GatewayError::Persistence)
    }
}
