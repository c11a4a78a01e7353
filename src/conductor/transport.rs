//! WebSocket Transport Layer
//!
//! Single responsibility: Connect to a WebSocket and send/receive binary messages.
//! No knowledge of the conductor protocol or session management.

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::time::Duration;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{http::Request, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::error::{ConnectError, Result};

/// Send half of the WebSocket
pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;

/// Receive half of the WebSocket
pub type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// A connected WebSocket with no protocol knowledge.
pub struct Transport {
    sink: WsSink,
    stream: WsStream,
}

impl Transport {
    /// Connect to a WebSocket endpoint, giving up after `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        debug!(url = %redact(url), "Connecting to WebSocket");

        let request = Request::builder()
            .uri(url)
            .header("Host", extract_host(url))
            .header("Origin", "http://localhost")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .body(())
            .map_err(|e| ConnectError::Connection(format!("Failed to build request: {}", e)))?;

        let (ws, _) = tokio::time::timeout(timeout, connect_async_with_config(request, None, false))
            .await
            .map_err(|_| ConnectError::Timeout(format!("connecting to {}", redact(url))))?
            .map_err(|e| ConnectError::Connection(format!("WebSocket connect failed: {}", e)))?;

        let (sink, stream) = ws.split();
        debug!(url = %redact(url), "WebSocket connected");
        Ok(Self { sink, stream })
    }

    pub async fn send(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(Message::Binary(data))
            .await
            .map_err(|e| ConnectError::Transport(format!("Failed to send: {}", e)))
    }

    /// Receive the next binary message. `None` once the connection is closed.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Pong is handled automatically by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ConnectError::Transport(format!("WebSocket error: {}", e))),
            }
        }
    }

    /// Split into separate sink and stream for concurrent send/receive.
    pub fn split(self) -> (WsSink, WsStream) {
        (self.sink, self.stream)
    }
}

/// Extract host from URL for Host header
fn extract_host(url: &str) -> &str {
    url.split("//")
        .nth(1)
        .and_then(|s| s.split(['/', '?']).next())
        .unwrap_or("localhost")
}

/// Strip the query string so API keys never reach the logs.
pub fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_host() {
        assert_eq!(extract_host("ws://localhost:4444"), "localhost:4444");
        assert_eq!(extract_host("wss://doorway.elohim.host/hc/admin"), "doorway.elohim.host");
        assert_eq!(extract_host("wss://doorway.elohim.host?apiKey=x"), "doorway.elohim.host");
        assert_eq!(extract_host("invalid"), "localhost");
    }

    #[test]
    fn test_redact_drops_query() {
        assert_eq!(
            redact("wss://doorway.elohim.host/hc/admin?apiKey=secret"),
            "wss://doorway.elohim.host/hc/admin"
        );
    }
}
