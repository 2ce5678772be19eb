//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `StreamTransport`: Opens one push-streaming session per topic
//! - `TransportSession`: Yields raw frames until error or end-of-stream
//! - `FrameDecoder`: Turns raw frames into typed messages
//!
//! ## Driver Ports (Inbound)
//!
//! - `StatsSource`: Read-only view of multiplexer state for health reporting

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::subscription::MultiplexerStats;
use crate::domain::topic::Topic;

// =============================================================================
// Errors
// =============================================================================

/// Transport-level failures. Any of these ends the current connection epoch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection attempt did not complete in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// No frame arrived within the idle timeout.
    #[error("no frames received for {0:?}")]
    Idle(Duration),

    /// The open stream failed.
    #[error("stream error: {0}")]
    Stream(String),
}

impl TransportError {
    /// Short label used for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "connection_failed",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::Idle(_) => "idle",
            Self::Stream(_) => "stream",
        }
    }
}

/// Frame decoding failures. The frame is dropped; the connection stays up.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// JSON parsing failed.
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    /// The event type is not one this decoder understands.
    #[error("unknown event type: {0}")]
    UnknownEvent(String),

    /// The frame is structurally invalid.
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),
}

// =============================================================================
// Streaming Transport
// =============================================================================

/// Opens push-streaming sessions bound to a single topic.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Connect to the stream that carries `topic`.
    async fn connect(&self, topic: &Topic) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// One open streaming connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportSession: Send {
    /// Wait for the next frame.
    ///
    /// Returns `None` once the remote side has closed the stream.
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, TransportError>>;

    /// Close the connection gracefully.
    async fn close(&mut self);
}

// =============================================================================
// Frame Decoding
// =============================================================================

/// Decodes raw frames into the message type handed to subscribers.
pub trait FrameDecoder: Send + Sync + 'static {
    /// Decoded message type.
    type Message: Send + Sync + 'static;

    /// Decode one frame received on `topic`.
    ///
    /// # Errors
    ///
    /// Returns a `DecodeError` if the frame cannot be parsed.
    fn decode(&self, topic: &Topic, frame: &[u8]) -> Result<Self::Message, DecodeError>;
}

// =============================================================================
// Stats
// =============================================================================

/// Read-only view of multiplexer state.
pub trait StatsSource: Send + Sync {
    /// Snapshot the current statistics.
    fn stats(&self) -> MultiplexerStats;
}
