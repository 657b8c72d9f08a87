use async_trait::async_trait;
use courier_types::events::{GatewayCommand, GatewayEvent};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::error::ClientError;

/// One live connection to the gateway. The session supervisor owns exactly
/// one at a time and replaces it wholesale on reconnect.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, cmd: &GatewayCommand) -> Result<(), ClientError>;

    /// Next decoded event, or `None` once the connection is closed. Unknown
    /// or malformed frames are skipped, not surfaced as closure.
    async fn next_event(&mut self) -> Option<GatewayEvent>;
}

/// Factory for transports, so the supervisor can reconnect without knowing
/// the wire details and tests can substitute channel-backed fakes.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, ClientError>;
}

/// WebSocket connector against a running gateway. The token travels as a
/// query parameter; the server validates it before upgrading.
pub struct WsConnector {
    url: String,
    token: String,
}

impl WsConnector {
    /// `base_url` is the ws scheme root, e.g. `ws://localhost:3000`.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: base_url.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ClientError> {
        let url = format!("{}/gateway?token={}", self.url, self.token);
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, cmd: &GatewayCommand) -> Result<(), ClientError> {
        let text =
            serde_json::to_string(cmd).map_err(|e| ClientError::Transport(e.to_string()))?;
        self.stream
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn next_event(&mut self) -> Option<GatewayEvent> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("websocket read failed: {}", e);
                    return None;
                }
            };

            match msg {
                WsMessage::Text(text) => match serde_json::from_str(&text) {
                    Ok(event) => return Some(event),
                    Err(e) => {
                        debug!("skipping undecodable frame: {}", e);
                    }
                },
                WsMessage::Ping(data) => {
                    // Server heartbeat; answer or get dropped.
                    if self.stream.send(WsMessage::Pong(data)).await.is_err() {
                        return None;
                    }
                }
                WsMessage::Close(_) => return None,
                _ => {}
            }
        }
    }
}
