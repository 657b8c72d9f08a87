use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use courier_types::events::{GatewayCommand, GatewayEvent};
use courier_types::{ConnId, UserId};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::gateway::Gateway;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Serve one pre-authenticated WebSocket connection. The JWT was validated at
/// the HTTP upgrade layer, so this goes straight to Ready + event loop.
pub async fn handle_connection(
    socket: WebSocket,
    gateway: Gateway,
    user_id: UserId,
    username: String,
) {
    let (mut sender, mut receiver) = socket.split();
    let conn_id = ConnId::new();

    info!("{} ({}) connected as {}", username, user_id, conn_id);

    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    let Ok(ready_json) = serde_json::to_string(&ready) else {
        return;
    };
    if sender.send(WsMessage::Text(ready_json.into())).await.is_err() {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    gateway.connect(conn_id, user_id, tx).await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward targeted + fanout events to the socket, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };

                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("failed to encode event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client.
    let gateway_recv = gateway.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                WsMessage::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&gateway_recv, conn_id, cmd).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            conn_id,
                            e,
                            log_preview(&text)
                        );
                        gateway_recv
                            .registry
                            .send_to_conn(
                                conn_id,
                                GatewayEvent::Error {
                                    detail: format!("malformed command: {e}"),
                                },
                            )
                            .await;
                    }
                },
                WsMessage::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    gateway.disconnect(conn_id).await;
    info!("{} ({}) disconnected ({})", username, user_id, conn_id);
}

/// First ~200 bytes of a raw frame for the log, cut on a char boundary so a
/// multi-byte character straddling the limit cannot panic the recv task.
fn log_preview(text: &str) -> &str {
    const MAX_BYTES: usize = 200;
    if text.len() <= MAX_BYTES {
        return text;
    }
    let mut end = MAX_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

async fn handle_command(gateway: &Gateway, conn_id: ConnId, cmd: GatewayCommand) {
    let result = match cmd {
        GatewayCommand::Join { room_id } => gateway.join_room(conn_id, room_id).await,

        GatewayCommand::Leave { room_id } => gateway.leave_room(conn_id, room_id).await,

        GatewayCommand::Send {
            room_id,
            client_temp_id,
            payload,
        } => {
            // The pipeline notifies the origin itself (targeted failure
            // signal or echo), so there is nothing further to report here.
            let _ = gateway
                .send_message(conn_id, room_id, client_temp_id, payload)
                .await;
            return;
        }

        GatewayCommand::AddReaction { message_id, emoji } => {
            gateway.add_reaction(conn_id, message_id, emoji).await
        }

        GatewayCommand::RemoveReaction { message_id, emoji } => {
            gateway.remove_reaction(conn_id, message_id, emoji).await
        }

        GatewayCommand::Pin { message_id } => gateway.set_pinned(conn_id, message_id, true).await,

        GatewayCommand::Unpin { message_id } => {
            gateway.set_pinned(conn_id, message_id, false).await
        }

        GatewayCommand::MarkRead { message_id } => gateway.mark_read(conn_id, message_id).await,

        GatewayCommand::OpenRoom { room_id, up_to } => {
            gateway.open_room(conn_id, room_id, up_to).await.map(|_| ())
        }
    };

    if let Err(e) = result {
        gateway
            .registry
            .send_to_conn(conn_id, GatewayEvent::Error { detail: e.to_string() })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::log_preview;

    #[test]
    fn short_frames_pass_through() {
        assert_eq!(log_preview("not json"), "not json");
    }

    #[test]
    fn long_frames_are_cut_at_a_char_boundary() {
        // A two-byte char spanning bytes 199..201 must not split the slice.
        let frame = format!("{}é{}", "a".repeat(199), "b".repeat(100));
        let preview = log_preview(&frame);
        assert_eq!(preview.len(), 199);
        assert!(preview.chars().all(|c| c == 'a'));

        let ascii = "x".repeat(500);
        assert_eq!(log_preview(&ascii).len(), 200);
    }
}
