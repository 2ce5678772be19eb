//! WebSocket Stream Transport
//!
//! `StreamTransport` over `tokio-tungstenite`. Each topic gets its own raw
//! stream at `{base_url}/{topic}`, for example
//! `wss://stream.binance.com:9443/ws/btcusdt@aggTrade`.
//!
//! Text and binary messages become frames. Ping/pong is answered by
//! tungstenite itself; a close frame or end of stream ends the session.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{StreamTransport, TransportError, TransportSession};
use crate::domain::topic::Topic;

/// WebSocket transport with one connection per topic.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    base_url: String,
}

impl WebSocketTransport {
    /// Create a transport rooted at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// URL of the stream carrying `topic`.
    #[must_use]
    pub fn stream_url(&self, topic: &Topic) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), topic)
    }
}

#[async_trait]
impl StreamTransport for WebSocketTransport {
    async fn connect(&self, topic: &Topic) -> Result<Box<dyn TransportSession>, TransportError> {
        let url = self.stream_url(topic);
        tracing::debug!(url = %url, "Opening WebSocket");

        let (stream, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(Box::new(WebSocketSession { stream }))
    }
}

struct WebSocketSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportSession for WebSocketSession {
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_bytes().to_vec())),
                Ok(Message::Binary(data)) => return Some(Ok(data.to_vec())),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(frame = ?frame, "WebSocket closed by server");
                    return None;
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Some(Err(TransportError::Stream(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "WebSocket close failed");
        }
    }
}
