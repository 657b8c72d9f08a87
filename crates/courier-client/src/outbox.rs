use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_types::api::{SendMessageRequest, SendMessageResponse};
use courier_types::events::GatewayCommand;
use courier_types::{ClientTempId, Message, MessagePayload, RoomId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ClientError;
use crate::store::LocalStore;
use crate::transport::Transport;

const KEY_PREFIX: &str = "outbox/";

/// One queued send, persisted to the local store until the server durably
/// owns the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSend {
    pub room_id: RoomId,
    pub client_temp_id: ClientTempId,
    pub payload: MessagePayload,
    pub queued_at: DateTime<Utc>,
}

/// HTTP escape hatch used when the socket path fails: the same idempotency
/// key rides along, so a message that actually made it through the socket is
/// deduped server-side.
#[async_trait]
pub trait FallbackSender: Send + Sync {
    async fn send(&self, item: &PendingSend) -> Result<Message, ClientError>;
}

pub struct HttpFallback {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpFallback {
    /// `base_url` is the http scheme root, e.g. `http://localhost:3000`.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl FallbackSender for HttpFallback {
    async fn send(&self, item: &PendingSend) -> Result<Message, ClientError> {
        let url = format!("{}/rooms/{}/messages", self.base_url, item.room_id);
        let body = SendMessageRequest {
            client_temp_id: Some(item.client_temp_id.clone()),
            payload: item.payload.clone(),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Fallback(e.to_string()))?
            .error_for_status()
            .map_err(|e| ClientError::Fallback(e.to_string()))?;

        let parsed: SendMessageResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Fallback(e.to_string()))?;
        Ok(parsed.message)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Handed to the primary transport; awaiting the broadcast confirm.
    pub sent: usize,
    /// Confirmed durable via the fallback path and removed.
    pub confirmed: usize,
    /// Both paths failed; still queued.
    pub kept: usize,
}

/// Durable queue of unsent messages. Every mutation hits the local store
/// before returning, so a crash between enqueue and flush loses nothing.
pub struct Outbox {
    store: Arc<dyn LocalStore>,
    flushing: AtomicBool,
}

impl Outbox {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            flushing: AtomicBool::new(false),
        }
    }

    /// Queue a message, generating its idempotency key. The item is durable
    /// once this returns.
    pub fn enqueue(
        &self,
        room_id: RoomId,
        payload: MessagePayload,
    ) -> Result<ClientTempId, ClientError> {
        let temp_id = ClientTempId::new(Uuid::new_v4().to_string());
        let item = PendingSend {
            room_id,
            client_temp_id: temp_id.clone(),
            payload,
            queued_at: Utc::now(),
        };
        self.persist(&item)?;
        Ok(temp_id)
    }

    /// Re-queue an existing item (retry after restart). Deduped by temp id:
    /// an already-queued item is left untouched.
    pub fn enqueue_item(&self, item: &PendingSend) -> Result<bool, ClientError> {
        let key = key_for(&item.client_temp_id);
        if self.store.get(&key).map_err(ClientError::Store)?.is_some() {
            return Ok(false);
        }
        self.persist(item)?;
        Ok(true)
    }

    /// The server durably owns this message (broadcast echo or fallback
    /// response arrived); forget it.
    pub fn confirm(&self, temp_id: &ClientTempId) -> Result<(), ClientError> {
        self.store.remove(&key_for(temp_id)).map_err(ClientError::Store)
    }

    /// Oldest first.
    pub fn pending(&self) -> Result<Vec<PendingSend>, ClientError> {
        let mut items = Vec::new();
        for key in self.store.keys(KEY_PREFIX).map_err(ClientError::Store)? {
            let Some(value) = self.store.get(&key).map_err(ClientError::Store)? else {
                continue;
            };
            match serde_json::from_value::<PendingSend>(value) {
                Ok(item) => items.push(item),
                Err(e) => warn!("dropping corrupt outbox entry {key}: {e}"),
            }
        }
        items.sort_by(|a, b| {
            a.queued_at
                .cmp(&b.queued_at)
                .then_with(|| a.client_temp_id.0.cmp(&b.client_temp_id.0))
        });
        Ok(items)
    }

    /// Drain the queue: primary transport first, HTTP fallback on failure.
    /// Items sent over the primary stay queued until their broadcast confirm
    /// arrives (`confirm`); items the fallback acknowledged are removed here.
    /// A flush already in progress makes this a no-op; per-item sends are
    /// never interrupted mid-item.
    pub async fn flush(
        &self,
        mut primary: Option<&mut (dyn Transport + '_)>,
        fallback: Option<&dyn FallbackSender>,
    ) -> Result<FlushSummary, ClientError> {
        if self.flushing.swap(true, Ordering::AcqRel) {
            debug!("flush already in progress");
            return Ok(FlushSummary::default());
        }

        let mut summary = FlushSummary::default();
        let items = match self.pending() {
            Ok(items) => items,
            Err(e) => {
                self.flushing.store(false, Ordering::Release);
                return Err(e);
            }
        };

        for item in &items {
            if let Some(transport) = primary.as_deref_mut() {
                let cmd = GatewayCommand::Send {
                    room_id: item.room_id,
                    client_temp_id: Some(item.client_temp_id.clone()),
                    payload: item.payload.clone(),
                };
                match transport.send(&cmd).await {
                    Ok(()) => {
                        summary.sent += 1;
                        continue;
                    }
                    Err(e) => {
                        // A failed write means the transport is gone; stop
                        // offering it to the remaining items.
                        warn!("primary send failed, switching to fallback: {e}");
                        primary = None;
                    }
                }
            }

            match fallback {
                Some(sender) => match sender.send(item).await {
                    Ok(message) => {
                        debug!(message_id = %message.id, "fallback send confirmed");
                        if let Err(e) = self.confirm(&item.client_temp_id) {
                            warn!("failed to clear confirmed outbox entry: {e}");
                        }
                        summary.confirmed += 1;
                    }
                    Err(e) => {
                        warn!("fallback send failed, keeping item queued: {e}");
                        summary.kept += 1;
                    }
                },
                None => summary.kept += 1,
            }
        }

        self.flushing.store(false, Ordering::Release);
        Ok(summary)
    }

    fn persist(&self, item: &PendingSend) -> Result<(), ClientError> {
        let value = serde_json::to_value(item)
            .map_err(|e| ClientError::Store(anyhow::Error::new(e)))?;
        self.store
            .put(&key_for(&item.client_temp_id), &value)
            .map_err(ClientError::Store)
    }
}

fn key_for(temp_id: &ClientTempId) -> String {
    format!("{KEY_PREFIX}{temp_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use courier_types::events::GatewayCommand;
    use courier_types::{MessageId, UserId};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn text(body: &str) -> MessagePayload {
        MessagePayload::Text { body: body.into() }
    }

    struct RecordingTransport {
        sent: Vec<GatewayCommand>,
        fail: bool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&mut self, cmd: &GatewayCommand) -> Result<(), ClientError> {
            if self.fail {
                return Err(ClientError::Transport("broken pipe".into()));
            }
            self.sent.push(cmd.clone());
            Ok(())
        }

        async fn next_event(&mut self) -> Option<courier_types::events::GatewayEvent> {
            None
        }
    }

    struct FakeFallback {
        fail: bool,
        calls: Mutex<Vec<ClientTempId>>,
    }

    impl FakeFallback {
        fn new(fail: bool) -> Self {
            Self { fail, calls: Mutex::new(vec![]) }
        }
    }

    #[async_trait]
    impl FallbackSender for FakeFallback {
        async fn send(&self, item: &PendingSend) -> Result<Message, ClientError> {
            self.calls.lock().unwrap().push(item.client_temp_id.clone());
            if self.fail {
                return Err(ClientError::Fallback("http 503".into()));
            }
            Ok(Message {
                id: MessageId(1),
                room_id: item.room_id,
                sender_id: UserId(Uuid::new_v4()),
                payload: item.payload.clone(),
                pinned: false,
                deleted: false,
                created_at: Utc::now(),
                client_temp_id: Some(item.client_temp_id.clone()),
            })
        }
    }

    #[test]
    fn enqueue_is_durable_across_outbox_instances() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let room = RoomId(Uuid::new_v4());

        let temp_id = Outbox::new(store.clone()).enqueue(room, text("offline")).unwrap();

        // A fresh outbox over the same store still sees the item.
        let revived = Outbox::new(store);
        let pending = revived.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].client_temp_id, temp_id);
    }

    #[test]
    fn enqueue_item_dedupes_by_temp_id() {
        let outbox = Outbox::new(Arc::new(MemoryStore::new()));
        let item = PendingSend {
            room_id: RoomId(Uuid::new_v4()),
            client_temp_id: ClientTempId::new("fixed"),
            payload: text("x"),
            queued_at: Utc::now(),
        };

        assert!(outbox.enqueue_item(&item).unwrap());
        assert!(!outbox.enqueue_item(&item).unwrap());
        assert_eq!(outbox.pending().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn primary_send_keeps_item_until_confirm() {
        let outbox = Outbox::new(Arc::new(MemoryStore::new()));
        let room = RoomId(Uuid::new_v4());
        let temp_id = outbox.enqueue(room, text("hi")).unwrap();

        let mut transport = RecordingTransport { sent: vec![], fail: false };
        let summary = outbox.flush(Some(&mut transport), None).await.unwrap();

        assert_eq!(summary, FlushSummary { sent: 1, confirmed: 0, kept: 0 });
        assert_eq!(transport.sent.len(), 1);
        // Still queued: the durable confirm has not arrived yet.
        assert_eq!(outbox.pending().unwrap().len(), 1);

        outbox.confirm(&temp_id).unwrap();
        assert!(outbox.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn broken_primary_falls_back_and_removes_on_ack() {
        let outbox = Outbox::new(Arc::new(MemoryStore::new()));
        outbox.enqueue(RoomId(Uuid::new_v4()), text("hi")).unwrap();

        let mut transport = RecordingTransport { sent: vec![], fail: true };
        let fallback = FakeFallback::new(false);
        let summary = outbox
            .flush(Some(&mut transport), Some(&fallback))
            .await
            .unwrap();

        assert_eq!(summary, FlushSummary { sent: 0, confirmed: 1, kept: 0 });
        assert_eq!(fallback.calls.lock().unwrap().len(), 1);
        assert!(outbox.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dual_failure_keeps_item_queued() {
        let outbox = Outbox::new(Arc::new(MemoryStore::new()));
        outbox.enqueue(RoomId(Uuid::new_v4()), text("hi")).unwrap();

        let mut transport = RecordingTransport { sent: vec![], fail: true };
        let fallback = FakeFallback::new(true);
        let summary = outbox
            .flush(Some(&mut transport), Some(&fallback))
            .await
            .unwrap();

        assert_eq!(summary, FlushSummary { sent: 0, confirmed: 0, kept: 1 });
        assert_eq!(outbox.pending().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overlapping_flush_is_suppressed() {
        struct BlockingFallback {
            release: Arc<Notify>,
            entered: Arc<Notify>,
        }

        #[async_trait]
        impl FallbackSender for BlockingFallback {
            async fn send(&self, item: &PendingSend) -> Result<Message, ClientError> {
                self.entered.notify_one();
                self.release.notified().await;
                Ok(Message {
                    id: MessageId(1),
                    room_id: item.room_id,
                    sender_id: UserId(Uuid::new_v4()),
                    payload: item.payload.clone(),
                    pinned: false,
                    deleted: false,
                    created_at: Utc::now(),
                    client_temp_id: Some(item.client_temp_id.clone()),
                })
            }
        }

        let outbox = Arc::new(Outbox::new(Arc::new(MemoryStore::new())));
        outbox.enqueue(RoomId(Uuid::new_v4()), text("hi")).unwrap();

        let release = Arc::new(Notify::new());
        let entered = Arc::new(Notify::new());
        let fallback = Arc::new(BlockingFallback {
            release: release.clone(),
            entered: entered.clone(),
        });

        let first = {
            let outbox = outbox.clone();
            let fallback = fallback.clone();
            tokio::spawn(async move { outbox.flush(None, Some(fallback.as_ref())).await })
        };
        entered.notified().await;

        // Second flush while the first is parked inside the fallback.
        let second = outbox.flush(None, Some(fallback.as_ref())).await.unwrap();
        assert_eq!(second, FlushSummary::default());

        release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first, FlushSummary { sent: 0, confirmed: 1, kept: 0 });
    }

    #[tokio::test]
    async fn flush_drains_oldest_first() {
        let outbox = Outbox::new(Arc::new(MemoryStore::new()));
        let room = RoomId(Uuid::new_v4());
        let first = PendingSend {
            room_id: room,
            client_temp_id: ClientTempId::new("a"),
            payload: text("first"),
            queued_at: Utc::now() - chrono::Duration::seconds(10),
        };
        let second = PendingSend {
            room_id: room,
            client_temp_id: ClientTempId::new("b"),
            payload: text("second"),
            queued_at: Utc::now(),
        };
        outbox.enqueue_item(&second).unwrap();
        outbox.enqueue_item(&first).unwrap();

        let mut transport = RecordingTransport { sent: vec![], fail: false };
        outbox.flush(Some(&mut transport), None).await.unwrap();

        let temp_ids: Vec<_> = transport
            .sent
            .iter()
            .map(|cmd| match cmd {
                GatewayCommand::Send { client_temp_id, .. } => {
                    client_temp_id.clone().unwrap().0
                }
                _ => panic!("unexpected command"),
            })
            .collect();
        assert_eq!(temp_ids, vec!["a", "b"]);
    }
}
