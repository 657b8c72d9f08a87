use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use courier_types::{ConnId, RoomId};
use tokio::sync::RwLock;
use tracing::debug;

/// Live per-room connection sets, used to scope fanout. Tracks connections,
/// not users: a user with two devices appears twice if both joined. Canonical
/// room membership lives in storage; this is only who is listening right now.
#[derive(Clone, Default)]
pub struct RoomTracker {
    inner: Arc<RwLock<HashMap<RoomId, HashSet<ConnId>>>>,
}

impl RoomTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent join. Returns true only when the connection was newly added.
    pub async fn join(&self, room_id: RoomId, conn_id: ConnId) -> bool {
        let mut rooms = self.inner.write().await;
        let newly = rooms.entry(room_id).or_default().insert(conn_id);
        if newly {
            debug!(%room_id, %conn_id, "room tracker: joined");
        }
        newly
    }

    pub async fn leave(&self, room_id: RoomId, conn_id: ConnId) -> bool {
        let mut rooms = self.inner.write().await;
        let Some(set) = rooms.get_mut(&room_id) else {
            return false;
        };
        let removed = set.remove(&conn_id);
        if set.is_empty() {
            rooms.remove(&room_id);
        }
        removed
    }

    /// Remove a connection from every room it joined. Returns the rooms it
    /// was in, so the caller can emit leave events.
    pub async fn leave_all(&self, conn_id: ConnId) -> Vec<RoomId> {
        let mut rooms = self.inner.write().await;
        let mut left = Vec::new();

        rooms.retain(|room_id, set| {
            if set.remove(&conn_id) {
                left.push(*room_id);
            }
            !set.is_empty()
        });

        left
    }

    pub async fn members_of(&self, room_id: RoomId) -> HashSet<ConnId> {
        self.inner
            .read()
            .await
            .get(&room_id)
            .cloned()
            .unwrap_or_default()
    }
}
