//! WebSocket transport
//!
//! Connects to a broker endpoint such as `ws://localhost:8084/mqtt` and
//! exchanges packets as JSON text frames, one packet per frame. Binary frames
//! are decoded the same way. A frame that does not decode is reported as a
//! protocol violation without tearing the link down.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};
use tungstenite::protocol::Message as WsMessage;

use super::{Connection, Connector, Packet};
use crate::utils::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WebSocketConnector {
    type Connection = WebSocketConnection;

    async fn open(&self) -> Result<WebSocketConnection> {
        let (stream, _response) = connect_async(self.url.as_str()).await?;
        info!("WebSocket link established to {}", self.url);
        Ok(WebSocketConnection::new(stream))
    }
}

pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketConnection {
    pub fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self { stream }
    }
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection").finish_non_exhaustive()
    }
}

pub(crate) fn encode(packet: &Packet) -> Result<String> {
    serde_json::to_string(packet)
        .map_err(|e| Error::ProtocolViolation(format!("failed to encode {}: {e}", packet.kind())))
}

pub(crate) fn decode(frame: &[u8]) -> Result<Packet> {
    serde_json::from_slice(frame)
        .map_err(|e| Error::ProtocolViolation(format!("undecodable frame: {e}")))
}

impl Connection for WebSocketConnection {
    async fn send(&mut self, packet: Packet) -> Result<()> {
        let text = encode(&packet)?;
        self.stream.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Packet>> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(WsMessage::Text(text))) => return decode(text.as_bytes()).map(Some),
                Some(Ok(WsMessage::Binary(bytes))) => return decode(&bytes).map(Some),
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!("WebSocket closed by peer: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
