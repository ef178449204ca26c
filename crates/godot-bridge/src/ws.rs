//! WebSocket transport for the editor plugin channel
//!
//! One JSON document per text frame. Pings are the heartbeat and pongs
//! count as the liveness acknowledgment.

use crate::codec::decode_message;
use crate::transport::{FrameReader, FrameWriter, Inbound, preview};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use godot_bridge_core::{BridgeError, Result};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, warn};

/// Close code sent to a second peer while one is already connected
pub const CLOSE_CODE_BUSY: u16 = 4000;

/// Close reason sent alongside [`CLOSE_CODE_BUSY`]
pub const CLOSE_REASON_BUSY: &str = "Another client is already connected";

type Socket = WebSocketStream<TcpStream>;

/// WebSocket read wrapper
pub struct WsReadWrapper(pub SplitStream<Socket>);

#[async_trait]
impl FrameReader for WsReadWrapper {
    async fn read_batch(&mut self) -> Result<Inbound> {
        loop {
            let message = match self.0.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    return Err(BridgeError::TransportClosed(format!(
                        "WebSocket read failed: {}",
                        e
                    )));
                }
                None => return Err(BridgeError::TransportClosed("WebSocket stream ended".into())),
            };

            match message {
                Message::Text(text) => {
                    if let Some(doc) = decode_message(text.as_str()) {
                        return Ok(Inbound::Documents(vec![doc]));
                    }
                }
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(text) => {
                        if let Some(doc) = decode_message(text) {
                            return Ok(Inbound::Documents(vec![doc]));
                        }
                    }
                    Err(_) => warn!("Dropping non-UTF-8 binary message ({} bytes)", data.len()),
                },
                Message::Pong(_) => return Ok(Inbound::Liveness),
                Message::Close(frame) => {
                    let reason = frame
                        .map(|f| format!("peer closed ({}): {}", u16::from(f.code), &*f.reason))
                        .unwrap_or_else(|| "peer closed".into());
                    return Err(BridgeError::TransportClosed(reason));
                }
                // Pings are answered by tungstenite itself
                Message::Ping(_) | Message::Frame(_) => {}
            }
        }
    }
}

/// WebSocket write wrapper
pub struct WsWriteWrapper(pub SplitSink<Socket, Message>);

#[async_trait]
impl FrameWriter for WsWriteWrapper {
    async fn write_document(&mut self, doc: &Value) -> Result<()> {
        let text = serde_json::to_string(doc)?;
        debug!("[Rust→Editor] len={} json={}", text.len(), preview(doc));
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| BridgeError::TransportUnavailable(format!("WebSocket write failed: {}", e)))
    }

    async fn heartbeat(&mut self) -> Result<()> {
        self.0
            .send(Message::Ping(Default::default()))
            .await
            .map_err(|e| BridgeError::TransportUnavailable(format!("WebSocket ping failed: {}", e)))
    }

    async fn close(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "bridge shutting down".into(),
        };
        // Sending Close may race the peer's own close; either way we are done
        if let Err(e) = self.0.send(Message::Close(Some(frame))).await {
            debug!("WebSocket close frame not sent: {}", e);
        }
        Ok(())
    }
}

/// Turn away a peer because another one is active
pub async fn reject_busy(mut socket: Socket) {
    let frame = CloseFrame {
        code: CloseCode::from(CLOSE_CODE_BUSY),
        reason: CLOSE_REASON_BUSY.into(),
    };
    if let Err(e) = socket.close(Some(frame)).await {
        debug!("Failed to close rejected peer: {}", e);
    }
}
