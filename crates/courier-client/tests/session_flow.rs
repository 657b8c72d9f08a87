//! Session supervisor exercises with channel-backed fake transports: connect
//! lifecycle, join replay after reconnect, and outbox flush on connect.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use courier_client::{ClientError, ClientEvent, Connector, MemoryStore, Transport, start};
use courier_types::events::{GatewayCommand, GatewayEvent};
use courier_types::{
    ClientTempId, Message, MessageId, MessagePayload, RoomId, UserId,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

struct FakeTransport {
    sent_tx: mpsc::UnboundedSender<GatewayCommand>,
    event_rx: mpsc::UnboundedReceiver<GatewayEvent>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&mut self, cmd: &GatewayCommand) -> Result<(), ClientError> {
        self.sent_tx
            .send(cmd.clone())
            .map_err(|_| ClientError::Transport("closed".into()))
    }

    async fn next_event(&mut self) -> Option<GatewayEvent> {
        self.event_rx.recv().await
    }
}

/// The server side of one fake connection.
struct ServerEnd {
    sent_rx: mpsc::UnboundedReceiver<GatewayCommand>,
    event_tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl ServerEnd {
    async fn next_command(&mut self) -> GatewayCommand {
        timeout(WAIT, self.sent_rx.recv())
            .await
            .expect("timed out waiting for client command")
            .expect("client transport dropped")
    }

    /// Closing the event channel looks like a dropped connection.
    fn drop_connection(self) {}
}

struct FakeConnector {
    prepared: Mutex<VecDeque<FakeTransport>>,
}

impl FakeConnector {
    fn new() -> (Arc<Self>, PreparedConnections) {
        let connector = Arc::new(Self {
            prepared: Mutex::new(VecDeque::new()),
        });
        (connector.clone(), PreparedConnections { connector })
    }
}

struct PreparedConnections {
    connector: Arc<FakeConnector>,
}

impl PreparedConnections {
    /// Queue one successful connect attempt, returning its server end.
    fn accept_next(&self) -> ServerEnd {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.connector
            .prepared
            .lock()
            .unwrap()
            .push_back(FakeTransport { sent_tx, event_rx });
        ServerEnd { sent_rx, event_tx }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ClientError> {
        match self.prepared.lock().unwrap().pop_front() {
            Some(t) => Ok(Box::new(t)),
            None => Err(ClientError::Transport("connection refused".into())),
        }
    }
}

async fn expect_event(
    sub: &mut courier_client::EventSubscription,
    want: fn(&ClientEvent) -> bool,
) -> ClientEvent {
    loop {
        let event = timeout(WAIT, sub.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("event bus closed");
        if want(&event) {
            return event;
        }
    }
}

fn text(body: &str) -> MessagePayload {
    MessagePayload::Text { body: body.into() }
}

fn echo_for(temp_id: &ClientTempId, room_id: RoomId) -> GatewayEvent {
    GatewayEvent::MessageCreate {
        message: Message {
            id: MessageId(1),
            room_id,
            sender_id: UserId(Uuid::new_v4()),
            payload: text("hello"),
            pinned: false,
            deleted: false,
            created_at: Utc::now(),
            client_temp_id: Some(temp_id.clone()),
        },
    }
}

#[tokio::test]
async fn connect_emits_lifecycle_and_forwards_events() {
    let (connector, prepared) = FakeConnector::new();
    let server = prepared.accept_next();

    let client = start(connector, None, Arc::new(MemoryStore::new()));
    let mut sub = client.subscribe();

    client.connect().unwrap();
    expect_event(&mut sub, |e| matches!(e, ClientEvent::Connecting)).await;
    expect_event(&mut sub, |e| matches!(e, ClientEvent::Connected)).await;

    let room = RoomId(Uuid::new_v4());
    server
        .event_tx
        .send(GatewayEvent::MemberJoined {
            room_id: room,
            user_id: UserId(Uuid::new_v4()),
        })
        .unwrap();

    let forwarded = expect_event(&mut sub, |e| matches!(e, ClientEvent::Gateway(_))).await;
    assert!(matches!(
        forwarded,
        ClientEvent::Gateway(GatewayEvent::MemberJoined { room_id, .. }) if room_id == room
    ));
}

#[tokio::test]
async fn commands_and_events_interleave_on_a_live_connection() {
    let (connector, prepared) = FakeConnector::new();
    let mut server = prepared.accept_next();

    let client = start(connector, None, Arc::new(MemoryStore::new()));
    let mut sub = client.subscribe();
    client.connect().unwrap();
    expect_event(&mut sub, |e| matches!(e, ClientEvent::Connected)).await;

    // Alternate directions a few times: each command goes out over the same
    // live transport that events keep arriving on.
    let id = MessageId(7);
    client.add_reaction(id, "🔥".into()).unwrap();
    assert!(matches!(
        server.next_command().await,
        GatewayCommand::AddReaction { message_id, .. } if message_id == id
    ));

    let room = RoomId(Uuid::new_v4());
    server
        .event_tx
        .send(GatewayEvent::PinChanged {
            room_id: room,
            message_id: id,
            pinned: true,
            by: UserId(Uuid::new_v4()),
        })
        .unwrap();
    expect_event(&mut sub, |e| {
        matches!(e, ClientEvent::Gateway(GatewayEvent::PinChanged { pinned: true, .. }))
    })
    .await;

    client.mark_read(id).unwrap();
    assert!(matches!(
        server.next_command().await,
        GatewayCommand::MarkRead { message_id } if message_id == id
    ));
}

#[tokio::test]
async fn joins_are_replayed_after_reconnect() {
    let (connector, prepared) = FakeConnector::new();
    let mut first = prepared.accept_next();

    let client = start(connector, None, Arc::new(MemoryStore::new()));
    let mut sub = client.subscribe();
    client.connect().unwrap();
    expect_event(&mut sub, |e| matches!(e, ClientEvent::Connected)).await;

    let room = RoomId(Uuid::new_v4());
    client.join(room).unwrap();
    assert!(matches!(
        first.next_command().await,
        GatewayCommand::Join { room_id } if room_id == room
    ));

    // Sever the connection; the client should announce the drop and retry.
    let mut second = prepared.accept_next();
    first.drop_connection();

    expect_event(&mut sub, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
    expect_event(&mut sub, |e| matches!(e, ClientEvent::Reconnecting { attempt: 1, .. })).await;
    expect_event(&mut sub, |e| matches!(e, ClientEvent::Connected)).await;

    // The room intent is replayed on the fresh transport, unprompted.
    assert!(matches!(
        second.next_command().await,
        GatewayCommand::Join { room_id } if room_id == room
    ));
}

#[tokio::test]
async fn offline_send_is_flushed_and_confirmed_on_connect() {
    let (connector, prepared) = FakeConnector::new();

    let client = start(connector, None, Arc::new(MemoryStore::new()));
    let mut sub = client.subscribe();

    // Queue while disconnected: durable immediately.
    let room = RoomId(Uuid::new_v4());
    let temp_id = client.send(room, text("hello")).unwrap();
    assert_eq!(client.pending_sends().unwrap().len(), 1);

    let mut server = prepared.accept_next();
    client.connect().unwrap();
    expect_event(&mut sub, |e| matches!(e, ClientEvent::Connected)).await;

    // The queued send rides the connect flush, carrying its temp id.
    let cmd = server.next_command().await;
    let GatewayCommand::Send { room_id, client_temp_id, .. } = cmd else {
        panic!("expected queued send, got {cmd:?}");
    };
    assert_eq!(room_id, room);
    assert_eq!(client_temp_id.as_ref(), Some(&temp_id));
    // Sent but not yet confirmed durable.
    assert_eq!(client.pending_sends().unwrap().len(), 1);

    // The broadcast echo confirms; the outbox forgets the item.
    server.event_tx.send(echo_for(&temp_id, room)).unwrap();
    expect_event(&mut sub, |e| {
        matches!(e, ClientEvent::Gateway(GatewayEvent::MessageCreate { .. }))
    })
    .await;
    assert!(client.pending_sends().unwrap().is_empty());
}

#[tokio::test]
async fn failed_connect_schedules_backoff_then_succeeds() {
    let (connector, prepared) = FakeConnector::new();

    let client = start(connector, None, Arc::new(MemoryStore::new()));
    let mut sub = client.subscribe();

    // No prepared transport: first attempt fails.
    client.connect().unwrap();
    expect_event(&mut sub, |e| matches!(e, ClientEvent::Connecting)).await;
    expect_event(&mut sub, |e| matches!(e, ClientEvent::Reconnecting { attempt: 1, .. })).await;

    // Second attempt (after ~500ms backoff) finds a listening server.
    let _server = prepared.accept_next();
    expect_event(&mut sub, |e| matches!(e, ClientEvent::Connected)).await;
}

#[tokio::test]
async fn explicit_disconnect_stops_reconnecting() {
    let (connector, prepared) = FakeConnector::new();
    let server = prepared.accept_next();

    let client = start(connector, None, Arc::new(MemoryStore::new()));
    let mut sub = client.subscribe();
    client.connect().unwrap();
    expect_event(&mut sub, |e| matches!(e, ClientEvent::Connected)).await;

    client.disconnect("user logged out").unwrap();
    let event = expect_event(&mut sub, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
    assert!(matches!(
        event,
        ClientEvent::Disconnected { reason } if reason == "user logged out"
    ));
    drop(server);

    // No reconnect attempts follow an explicit disconnect.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(sub.try_recv().is_none());
}
