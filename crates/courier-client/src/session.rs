use std::sync::Arc;

use courier_types::events::{GatewayCommand, GatewayEvent};
use courier_types::{ClientTempId, MessageId, MessagePayload, RoomId};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::{GIVE_UP_AFTER, RECONNECT_RESET_AFTER, schedule_reconnect};
use crate::error::ClientError;
use crate::events::{ClientEvent, EventBus, EventSubscription};
use crate::outbox::{FallbackSender, Outbox, PendingSend};
use crate::rejoin::RejoinSet;
use crate::store::LocalStore;
use crate::transport::{Connector, Transport};

enum SessionCommand {
    Connect,
    Disconnect { reason: String },
    Join { room_id: RoomId },
    Leave { room_id: RoomId },
    Flush,
    Gateway(GatewayCommand),
}

/// Handle to the supervised client session. Cheap to clone; dropping every
/// handle shuts the session down.
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    bus: EventBus,
    outbox: Arc<Outbox>,
    rejoin: Arc<RejoinSet>,
}

/// Spawn the session supervisor. `fallback` is the HTTP path the outbox uses
/// when the socket is down; pass `None` to run socket-only.
pub fn start(
    connector: Arc<dyn Connector>,
    fallback: Option<Arc<dyn FallbackSender>>,
    store: Arc<dyn LocalStore>,
) -> ClientHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let bus = EventBus::new();
    let outbox = Arc::new(Outbox::new(store));
    let rejoin = Arc::new(RejoinSet::new());

    tokio::spawn(run_session(
        cmd_rx,
        connector,
        fallback,
        outbox.clone(),
        rejoin.clone(),
        bus.clone(),
    ));

    ClientHandle { cmd_tx, bus, outbox, rejoin }
}

impl ClientHandle {
    pub fn subscribe(&self) -> EventSubscription {
        self.bus.subscribe()
    }

    pub fn connect(&self) -> Result<(), ClientError> {
        self.command(SessionCommand::Connect)
    }

    pub fn disconnect(&self, reason: impl Into<String>) -> Result<(), ClientError> {
        self.command(SessionCommand::Disconnect { reason: reason.into() })
    }

    /// Record the intent to be in this room and join the live fanout. The
    /// intent survives reconnects; the join is replayed on each.
    pub fn join(&self, room_id: RoomId) -> Result<(), ClientError> {
        self.rejoin.intend_join(room_id);
        self.command(SessionCommand::Join { room_id })
    }

    pub fn leave(&self, room_id: RoomId) -> Result<(), ClientError> {
        self.rejoin.intend_leave(room_id);
        self.command(SessionCommand::Leave { room_id })
    }

    /// Queue a message for delivery. Durable in the local store before this
    /// returns; the returned temp id correlates the eventual server record.
    pub fn send(
        &self,
        room_id: RoomId,
        payload: MessagePayload,
    ) -> Result<ClientTempId, ClientError> {
        let temp_id = self.outbox.enqueue(room_id, payload)?;
        self.command(SessionCommand::Flush)?;
        Ok(temp_id)
    }

    pub fn add_reaction(&self, message_id: MessageId, emoji: String) -> Result<(), ClientError> {
        self.command(SessionCommand::Gateway(GatewayCommand::AddReaction {
            message_id,
            emoji,
        }))
    }

    pub fn remove_reaction(&self, message_id: MessageId, emoji: String) -> Result<(), ClientError> {
        self.command(SessionCommand::Gateway(GatewayCommand::RemoveReaction {
            message_id,
            emoji,
        }))
    }

    pub fn pin(&self, message_id: MessageId) -> Result<(), ClientError> {
        self.command(SessionCommand::Gateway(GatewayCommand::Pin { message_id }))
    }

    pub fn unpin(&self, message_id: MessageId) -> Result<(), ClientError> {
        self.command(SessionCommand::Gateway(GatewayCommand::Unpin { message_id }))
    }

    pub fn mark_read(&self, message_id: MessageId) -> Result<(), ClientError> {
        self.command(SessionCommand::Gateway(GatewayCommand::MarkRead { message_id }))
    }

    /// Mark everything up to `up_to` read in one round trip.
    pub fn open_room(&self, room_id: RoomId, up_to: MessageId) -> Result<(), ClientError> {
        self.command(SessionCommand::Gateway(GatewayCommand::OpenRoom { room_id, up_to }))
    }

    /// Messages still waiting for a durable confirm.
    pub fn pending_sends(&self) -> Result<Vec<PendingSend>, ClientError> {
        self.outbox.pending()
    }

    fn command(&self, cmd: SessionCommand) -> Result<(), ClientError> {
        self.cmd_tx.send(cmd).map_err(|_| ClientError::TaskGone)
    }
}

/// One supervisor wakeup. The select arms only produce a `Step`; all state
/// handling happens afterwards, so no borrow of the transport is alive while
/// the handlers run or reassign it.
enum Step {
    Command(Option<SessionCommand>),
    Event(Option<GatewayEvent>),
    RetryDue,
}

async fn run_session(
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    connector: Arc<dyn Connector>,
    fallback: Option<Arc<dyn FallbackSender>>,
    outbox: Arc<Outbox>,
    rejoin: Arc<RejoinSet>,
    bus: EventBus,
) {
    let mut transport: Option<Box<dyn Transport>> = None;
    let mut wants_connection = false;
    let mut reconnect_attempt: u32 = 0;
    let mut reconnect_deadline: Option<Instant> = None;
    let mut retrying_since: Option<Instant> = None;
    let mut last_success: Option<Instant> = None;

    loop {
        // Take the live transport out of the slot for the duration of the
        // select so its borrow ends with the select expression. The retry
        // timer only runs while disconnected.
        let step = match transport.take() {
            Some(mut live) => {
                let step = tokio::select! {
                    cmd = cmd_rx.recv() => Step::Command(cmd),
                    event = live.next_event() => Step::Event(event),
                };
                transport = Some(live);
                step
            }
            None => tokio::select! {
                cmd = cmd_rx.recv() => Step::Command(cmd),
                _ = sleep_until_opt(reconnect_deadline) => Step::RetryDue,
            },
        };

        match step {
            Step::Command(None) => {
                debug!("all client handles dropped, shutting down session");
                break;
            }

            Step::Command(Some(cmd)) => match cmd {
                SessionCommand::Connect => {
                    wants_connection = true;
                    reconnect_attempt = 0;
                    reconnect_deadline = None;
                    retrying_since = None;

                    transport = establish(
                        connector.as_ref(),
                        fallback.as_deref(),
                        &outbox,
                        &rejoin,
                        &bus,
                    )
                    .await;

                    if transport.is_some() {
                        last_success = Some(Instant::now());
                    } else {
                        reconnect_deadline = schedule_retry(
                            &mut reconnect_attempt,
                            &mut retrying_since,
                            &mut wants_connection,
                            last_success,
                            &bus,
                        );
                    }
                }

                SessionCommand::Disconnect { reason } => {
                    wants_connection = false;
                    reconnect_deadline = None;
                    retrying_since = None;
                    transport = None;
                    bus.emit(ClientEvent::Disconnected { reason });
                }

                SessionCommand::Join { room_id } => {
                    if let Some(t) = transport.as_mut() {
                        // Failure here is recovered by the replay on the
                        // next reconnect, never queued into the outbox.
                        if let Err(e) = t.send(&GatewayCommand::Join { room_id }).await {
                            warn!(%room_id, "join failed, deferring to reconnect replay: {e}");
                        }
                    }
                }

                SessionCommand::Leave { room_id } => {
                    if let Some(t) = transport.as_mut() {
                        if let Err(e) = t.send(&GatewayCommand::Leave { room_id }).await {
                            warn!(%room_id, "leave failed: {e}");
                        }
                    }
                }

                SessionCommand::Flush => {
                    let result = outbox
                        .flush(transport.as_mut().map(|b| b.as_mut()), fallback.as_deref())
                        .await;
                    if let Err(e) = result {
                        warn!("outbox flush failed: {e}");
                    }
                }

                SessionCommand::Gateway(cmd) => match transport.as_mut() {
                    Some(t) => {
                        if let Err(e) = t.send(&cmd).await {
                            warn!("send failed, treating connection as lost: {e}");
                            transport = None;
                            bus.emit(ClientEvent::Disconnected {
                                reason: "connection lost".into(),
                            });
                            reconnect_deadline = schedule_retry(
                                &mut reconnect_attempt,
                                &mut retrying_since,
                                &mut wants_connection,
                                last_success,
                                &bus,
                            );
                        }
                    }
                    None => debug!("dropping command while disconnected"),
                },
            },

            Step::Event(Some(event)) => {
                reconcile_outbox(&outbox, &event);
                bus.emit(ClientEvent::Gateway(event));
            }

            Step::Event(None) => {
                transport = None;
                bus.emit(ClientEvent::Disconnected {
                    reason: "connection lost".into(),
                });
                if wants_connection {
                    reconnect_deadline = schedule_retry(
                        &mut reconnect_attempt,
                        &mut retrying_since,
                        &mut wants_connection,
                        last_success,
                        &bus,
                    );
                }
            }

            Step::RetryDue => {
                reconnect_deadline = None;

                transport = establish(
                    connector.as_ref(),
                    fallback.as_deref(),
                    &outbox,
                    &rejoin,
                    &bus,
                )
                .await;

                if transport.is_some() {
                    last_success = Some(Instant::now());
                    reconnect_attempt = 0;
                    retrying_since = None;
                } else {
                    reconnect_deadline = schedule_retry(
                        &mut reconnect_attempt,
                        &mut retrying_since,
                        &mut wants_connection,
                        last_success,
                        &bus,
                    );
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// One connection attempt: on success, replay room joins and flush the
/// outbox before handing the transport to the event loop.
async fn establish(
    connector: &dyn Connector,
    fallback: Option<&dyn FallbackSender>,
    outbox: &Outbox,
    rejoin: &RejoinSet,
    bus: &EventBus,
) -> Option<Box<dyn Transport>> {
    bus.emit(ClientEvent::Connecting);

    let mut transport = match connector.connect().await {
        Ok(t) => t,
        Err(e) => {
            warn!("connect failed: {e}");
            return None;
        }
    };

    info!("connected");
    bus.emit(ClientEvent::Connected);

    // Rejoin replay is fire-and-forget; a failed join is retried on the next
    // reconnect.
    for room_id in rejoin.rooms() {
        if let Err(e) = transport.send(&GatewayCommand::Join { room_id }).await {
            warn!(%room_id, "rejoin replay failed: {e}");
        }
    }

    if let Err(e) = outbox.flush(Some(transport.as_mut()), fallback).await {
        warn!("outbox flush on connect failed: {e}");
    }

    Some(transport)
}

/// Decide the next reconnect deadline, or give up after the retry window is
/// exhausted (requiring an explicit `connect` to resume).
fn schedule_retry(
    attempt: &mut u32,
    retrying_since: &mut Option<Instant>,
    wants_connection: &mut bool,
    last_success: Option<Instant>,
    bus: &EventBus,
) -> Option<Instant> {
    if !*wants_connection {
        return None;
    }

    let started = *retrying_since.get_or_insert_with(Instant::now);
    if Instant::now().duration_since(started) > GIVE_UP_AFTER {
        warn!("retry window exhausted, staying disconnected");
        *wants_connection = false;
        *attempt = 0;
        *retrying_since = None;
        bus.emit(ClientEvent::Disconnected {
            reason: "retry window exhausted".into(),
        });
        return None;
    }

    // A connection that held for a while starts the backoff over.
    if let Some(last) = last_success {
        if Instant::now().duration_since(last) > RECONNECT_RESET_AFTER {
            *attempt = 1;
        } else {
            *attempt = attempt.saturating_add(1).max(1);
        }
    } else {
        *attempt = attempt.saturating_add(1).max(1);
    }

    let (deadline, ms) = schedule_reconnect(*attempt);
    bus.emit(ClientEvent::Reconnecting {
        attempt: *attempt,
        next_retry_in_ms: ms,
    });
    Some(deadline)
}

/// Keep the durable outbox in step with server confirmations: a broadcast
/// echo carrying our temp id means the server owns the message now.
fn reconcile_outbox(outbox: &Outbox, event: &GatewayEvent) {
    match event {
        GatewayEvent::MessageCreate { message } => {
            if let Some(temp_id) = &message.client_temp_id {
                if let Err(e) = outbox.confirm(temp_id) {
                    warn!("failed to clear confirmed outbox entry: {e}");
                }
            }
        }
        GatewayEvent::MessageSaveFailed { client_temp_id } => {
            // Kept queued; the next flush retries it.
            debug!(%client_temp_id, "server failed to persist, will retry");
        }
        _ => {}
    }
}
