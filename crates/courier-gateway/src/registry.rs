use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use courier_types::events::GatewayEvent;
use courier_types::{ConnId, UserId};
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

/// Thread-safe map from user identity to live connections. A user may hold
/// several connections at once (multi-device). Injected, never a process-wide
/// singleton, so tests run independent instances.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    conns: HashMap<ConnId, ConnEntry>,
    by_user: HashMap<UserId, HashSet<ConnId>>,
}

struct ConnEntry {
    user_id: UserId,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

/// What `unregister` observed, so the caller can run the offline transition.
pub struct Unregistered {
    pub user_id: UserId,

    /// True when this was the user's last live connection.
    pub went_offline: bool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated connection. Returns true when this is the
    /// user's first live connection (offline → online transition).
    pub async fn register(
        &self,
        conn_id: ConnId,
        user_id: UserId,
        tx: mpsc::UnboundedSender<GatewayEvent>,
    ) -> bool {
        let mut inner = self.inner.write().await;
        inner.conns.insert(conn_id, ConnEntry { user_id, tx });
        let set = inner.by_user.entry(user_id).or_default();
        let came_online = set.is_empty();
        set.insert(conn_id);

        debug!(%conn_id, %user_id, came_online, "registry: connection registered");
        came_online
    }

    pub async fn unregister(&self, conn_id: ConnId) -> Option<Unregistered> {
        let mut inner = self.inner.write().await;
        let entry = inner.conns.remove(&conn_id)?;
        let user_id = entry.user_id;

        let went_offline = match inner.by_user.get_mut(&user_id) {
            Some(set) => {
                set.remove(&conn_id);
                if set.is_empty() {
                    inner.by_user.remove(&user_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        };

        debug!(%conn_id, %user_id, went_offline, "registry: connection unregistered");
        Some(Unregistered {
            user_id,
            went_offline,
        })
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.inner
            .read()
            .await
            .by_user
            .get(&user_id)
            .is_some_and(|set| !set.is_empty())
    }

    pub async fn connections_for(&self, user_id: UserId) -> HashSet<ConnId> {
        self.inner
            .read()
            .await
            .by_user
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn user_of(&self, conn_id: ConnId) -> Option<UserId> {
        self.inner.read().await.conns.get(&conn_id).map(|e| e.user_id)
    }

    /// Send a targeted event to one connection. Returns false when the
    /// connection is gone (its send task has dropped the receiver).
    pub async fn send_to_conn(&self, conn_id: ConnId, event: GatewayEvent) -> bool {
        let inner = self.inner.read().await;
        match inner.conns.get(&conn_id) {
            Some(entry) => entry.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Send to every live connection of one user (all devices).
    pub async fn send_to_user(&self, user_id: UserId, event: GatewayEvent) {
        let inner = self.inner.read().await;
        if let Some(set) = inner.by_user.get(&user_id) {
            for conn_id in set {
                if let Some(entry) = inner.conns.get(conn_id) {
                    let _ = entry.tx.send(event.clone());
                }
            }
        }
    }

    /// Send to every registered connection (presence fanout).
    pub async fn send_to_all(&self, event: GatewayEvent) {
        let inner = self.inner.read().await;
        for entry in inner.conns.values() {
            let _ = entry.tx.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn user() -> UserId {
        UserId(Uuid::new_v4())
    }

    #[tokio::test]
    async fn multi_device_presence_transitions() {
        let registry = ConnectionRegistry::new();
        let u = user();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let a = ConnId::new();
        let b = ConnId::new();

        assert!(registry.register(a, u, tx_a).await);
        // Second device: user already online.
        assert!(!registry.register(b, u, tx_b).await);
        assert_eq!(registry.connections_for(u).await.len(), 2);

        let first = registry.unregister(a).await.unwrap();
        assert!(!first.went_offline);
        assert!(registry.is_online(u).await);

        let last = registry.unregister(b).await.unwrap();
        assert!(last.went_offline);
        assert!(!registry.is_online(u).await);
    }

    #[tokio::test]
    async fn unregister_unknown_conn_is_none() {
        let registry = ConnectionRegistry::new();
        assert!(registry.unregister(ConnId::new()).await.is_none());
    }

    #[tokio::test]
    async fn send_to_user_reaches_all_devices() {
        let registry = ConnectionRegistry::new();
        let u = user();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry.register(ConnId::new(), u, tx_a).await;
        registry.register(ConnId::new(), u, tx_b).await;

        registry
            .send_to_user(u, GatewayEvent::PresenceUpdate { user_id: u, online: true })
            .await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn concurrent_register_unregister() {
        let registry = ConnectionRegistry::new();
        let u = user();

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let reg = registry.clone();
            tasks.push(tokio::spawn(async move {
                let conn = ConnId::new();
                let (tx, _rx) = mpsc::unbounded_channel();
                reg.register(conn, u, tx).await;
                reg.unregister(conn).await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert!(!registry.is_online(u).await);
        assert!(registry.connections_for(u).await.is_empty());
    }
}
