use std::sync::{Arc, Mutex};

use courier_types::events::GatewayEvent;
use tokio::sync::mpsc;

/// What subscribers observe: connection lifecycle plus every decoded gateway
/// event.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connecting,
    Connected,
    Reconnecting { attempt: u32, next_retry_in_ms: u64 },
    Disconnected { reason: String },
    Gateway(GatewayEvent),
}

/// Fan-out bus for [`ClientEvent`]s. Subscriptions are independent of the
/// underlying transport, so they survive reconnects; dropping a handle
/// unsubscribes on the next emit.
#[derive(Clone, Default)]
pub struct EventBus {
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<ClientEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut senders) = self.senders.lock() {
            senders.push(tx);
        }
        EventSubscription { rx }
    }

    /// Deliver to every live subscriber, pruning dropped ones.
    pub fn emit(&self, event: ClientEvent) {
        let Ok(mut senders) = self.senders.lock() else {
            return;
        };
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl EventSubscription {
    /// `None` once the client task has shut down.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_subscribers_receive() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(ClientEvent::Connecting);

        assert!(matches!(a.recv().await, Some(ClientEvent::Connecting)));
        assert!(matches!(b.recv().await, Some(ClientEvent::Connecting)));
    }

    #[tokio::test]
    async fn dropped_handles_are_pruned() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let mut b = bus.subscribe();
        drop(a);

        bus.emit(ClientEvent::Connected);
        assert_eq!(bus.senders.lock().unwrap().len(), 1);
        assert!(matches!(b.recv().await, Some(ClientEvent::Connected)));
    }

    #[tokio::test]
    async fn subscription_outlives_transport_churn() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        // Lifecycle churn does not invalidate the handle.
        bus.emit(ClientEvent::Disconnected { reason: "lost".into() });
        bus.emit(ClientEvent::Reconnecting { attempt: 1, next_retry_in_ms: 500 });
        bus.emit(ClientEvent::Connected);

        assert!(matches!(sub.recv().await, Some(ClientEvent::Disconnected { .. })));
        assert!(matches!(sub.recv().await, Some(ClientEvent::Reconnecting { .. })));
        assert!(matches!(sub.recv().await, Some(ClientEvent::Connected)));
    }
}
