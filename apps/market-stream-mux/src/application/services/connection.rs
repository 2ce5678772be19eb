//! Topic Connection
//!
//! Runs one connection epoch for a topic: connect, receive and dispatch
//! frames, and stop on cancellation, transport error or remote close.
//!
//! The connection never retries on its own. It reports how the epoch ended
//! and the owning supervisor decides, through the registry and the
//! reconnect policy, whether another epoch follows.

use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use super::registry::TopicSlot;
use crate::application::ports::{FrameDecoder, StreamTransport, TransportError, TransportSession};
use crate::domain::subscription::ConnectionState;
use crate::infrastructure::metrics;

/// Timeouts applied to every connection epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Upper bound on a connection attempt.
    pub connect_timeout: Duration,
    /// Treat the stream as failed when no frame arrives for this long.
    pub idle_timeout: Option<Duration>,
    /// Upper bound on a graceful close.
    pub close_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(60)),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// How a connection epoch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpochEnd {
    /// The slot was retired or the multiplexer shut down.
    Cancelled,
    /// The remote side closed the stream.
    RemoteClosed,
    /// Connecting or streaming failed.
    Failed(TransportError),
}

/// Summary of one connection epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochReport {
    /// How the epoch ended.
    pub end: EpochEnd,
    /// Frames received during the epoch.
    pub frames: u64,
}

/// One physical connection attempt bound to a topic slot.
pub struct TopicConnection<'a, D: FrameDecoder> {
    slot: &'a TopicSlot<D::Message>,
    transport: &'a dyn StreamTransport,
    decoder: &'a D,
    settings: &'a ConnectionSettings,
    session_id: Uuid,
}

impl<'a, D: FrameDecoder> TopicConnection<'a, D> {
    /// Create a connection for `slot`.
    #[must_use]
    pub fn new(
        slot: &'a TopicSlot<D::Message>,
        transport: &'a dyn StreamTransport,
        decoder: &'a D,
        settings: &'a ConnectionSettings,
    ) -> Self {
        Self {
            slot,
            transport,
            decoder,
            settings,
            session_id: Uuid::new_v4(),
        }
    }

    /// Run the epoch to completion.
    ///
    /// Returns once the slot is cancelled, the transport fails or the remote
    /// side closes. On cancellation the session is closed within
    /// `close_timeout` before this returns.
    pub async fn run(self) -> EpochReport {
        let topic = self.slot.topic();
        let cancel = self.slot.cancel_token();

        if cancel.is_cancelled() {
            return EpochReport {
                end: EpochEnd::Cancelled,
                frames: 0,
            };
        }

        self.slot.set_connection_state(ConnectionState::Connecting);
        tracing::info!(topic = %topic, session_id = %self.session_id, "Connecting topic stream");

        let started = Instant::now();
        let connected = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.slot.set_connection_state(ConnectionState::Closed);
                return EpochReport { end: EpochEnd::Cancelled, frames: 0 };
            }
            result = tokio::time::timeout(self.settings.connect_timeout, self.transport.connect(topic)) => result,
        };

        let mut session = match connected {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return self.fail(e, 0),
            Err(_) => return self.fail(TransportError::ConnectTimeout(self.settings.connect_timeout), 0),
        };

        metrics::record_connect_latency(started.elapsed());
        metrics::connection_opened();
        self.slot.set_connection_state(ConnectionState::Open);
        tracing::info!(topic = %topic, session_id = %self.session_id, "Topic stream open");

        let mut frames = 0u64;
        let end = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                next = next_frame(session.as_mut(), self.settings.idle_timeout) => Some(next),
            };

            match next {
                None => {
                    self.slot.set_connection_state(ConnectionState::Closing);
                    self.close_session(session.as_mut()).await;
                    break EpochEnd::Cancelled;
                }
                Some(Some(Ok(frame))) => {
                    frames += 1;
                    self.handle_frame(&frame);
                }
                Some(Some(Err(e))) => {
                    self.slot.set_connection_state(ConnectionState::Errored);
                    self.close_session(session.as_mut()).await;
                    break EpochEnd::Failed(e);
                }
                Some(None) => {
                    tracing::info!(topic = %topic, session_id = %self.session_id, "Remote closed topic stream");
                    break EpochEnd::RemoteClosed;
                }
            }
        };
        drop(session);
        metrics::connection_closed();

        match end {
            EpochEnd::Failed(e) => self.fail(e, frames),
            end => {
                self.slot.set_connection_state(ConnectionState::Closed);
                EpochReport { end, frames }
            }
        }
    }

    fn handle_frame(&self, frame: &[u8]) {
        let topic = self.slot.topic();
        self.slot.record_frame();
        metrics::record_frame_received(topic);

        match self.decoder.decode(topic, frame) {
            Ok(message) => {
                self.slot.dispatch(&message);
            }
            Err(e) => {
                self.slot.record_decode_error();
                metrics::record_decode_error(topic);
                tracing::warn!(
                    topic = %topic,
                    error = %e,
                    bytes = frame.len(),
                    "Dropping undecodable frame"
                );
            }
        }
    }

    async fn close_session(&self, session: &mut dyn TransportSession) {
        if tokio::time::timeout(self.settings.close_timeout, session.close())
            .await
            .is_err()
        {
            tracing::debug!(
                topic = %self.slot.topic(),
                timeout_ms = self.settings.close_timeout.as_millis(),
                "Graceful close timed out"
            );
        }
    }

    fn fail(&self, error: TransportError, frames: u64) -> EpochReport {
        self.slot.set_connection_state(ConnectionState::Errored);
        metrics::record_transport_error(error.kind());
        tracing::warn!(
            topic = %self.slot.topic(),
            session_id = %self.session_id,
            error = %error,
            frames,
            "Topic stream failed"
        );
        self.slot.set_connection_state(ConnectionState::Closed);
        EpochReport {
            end: EpochEnd::Failed(error),
            frames,
        }
    }
}

async fn next_frame(
    session: &mut dyn TransportSession,
    idle_timeout: Option<Duration>,
) -> Option<Result<Vec<u8>, TransportError>> {
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, session.next_frame())
            .await
            .unwrap_or(Some(Err(TransportError::Idle(limit)))),
        None => session.next_frame().await,
    }
}

// =============================================================================
// Tests
// =============================================================================
