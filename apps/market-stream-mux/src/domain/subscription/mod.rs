//! Subscription Bookkeeping Types
//!
//! Domain types for tracking the subscribers attached to a topic.
//!
//! # Design
//!
//! Each topic owns an ordered subscriber sequence:
//! - Subscribers are kept in the order they subscribed
//! - Every registration gets its own [`SubscriberId`], so the same callback
//!   registered twice is two independent subscribers
//! - Removing a registration reports how many remain, which drives
//!   connection teardown when the count reaches zero

use std::fmt;

use serde::Serialize;

use crate::domain::topic::Topic;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for one subscription registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Create a subscriber ID from a raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned by a subscriber callback.
///
/// Handler failures are isolated to the subscriber that raised them; they
/// are reported and never reach the transport or other subscribers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    /// Create a handler error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// Get the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of the physical connection behind a topic.
///
/// ```text
/// idle -> connecting -> open -> closing -> closed
///              \          \
///               +-> errored -> closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Created, no attempt made yet.
    #[default]
    Idle,
    /// Connection attempt in flight.
    Connecting,
    /// Connected and receiving frames.
    Open,
    /// Local close in progress.
    Closing,
    /// Closed, either for good or until the next reconnect attempt.
    Closed,
    /// Transport failed; a close report follows.
    Errored,
}

impl ConnectionState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Errored => "errored",
        }
    }

    /// Check if the connection is open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Topic Entry
// =============================================================================

/// Ordered subscriber sequence for one topic.
#[derive(Debug)]
pub struct TopicEntry<H> {
    subscribers: Vec<(SubscriberId, H)>,
}

impl<H> Default for TopicEntry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> TopicEntry<H> {
    /// Create an empty entry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    /// Append a subscriber.
    pub fn push(&mut self, id: SubscriberId, handler: H) {
        self.subscribers.push((id, handler));
    }

    /// Remove exactly one subscriber.
    ///
    /// Returns the number of subscribers remaining, or `None` if `id` was
    /// not registered here.
    pub fn remove(&mut self, id: SubscriberId) -> Option<usize> {
        let position = self.subscribers.iter().position(|(s, _)| *s == id)?;
        self.subscribers.remove(position);
        Some(self.subscribers.len())
    }

    /// Check whether a subscriber is registered.
    #[must_use]
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.iter().any(|(s, _)| *s == id)
    }

    /// Subscriber IDs in subscription order.
    #[must_use]
    pub fn ids(&self) -> Vec<SubscriberId> {
        self.subscribers.iter().map(|(s, _)| *s).collect()
    }

    /// Number of subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if there are no subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Drop every subscriber, returning how many were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.subscribers.len();
        self.subscribers.clear();
        removed
    }
}

impl<H: Clone> TopicEntry<H> {
    /// Copy the subscriber sequence for dispatch outside the lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(SubscriberId, H)> {
        self.subscribers.clone()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for a single topic.
#[derive(Debug, Clone, Serialize)]
pub struct TopicStats {
    /// Topic name.
    pub topic: Topic,
    /// Connection state.
    pub state: ConnectionState,
    /// Current subscriber count.
    pub subscribers: usize,
    /// Frames received across all connection epochs.
    pub frames_received: u64,
    /// Frames dropped because they failed to decode.
    pub decode_errors: u64,
    /// Handler invocations that failed or panicked.
    pub handler_errors: u64,
    /// Reconnect attempts scheduled.
    pub reconnects: u64,
}

/// Overall multiplexer statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MultiplexerStats {
    /// Whether the multiplexer has been shut down.
    pub terminated: bool,
    /// Per-topic statistics, ordered by topic name.
    pub topics: Vec<TopicStats>,
}

impl MultiplexerStats {
    /// Total subscribers across all topics.
    #[must_use]
    pub fn total_subscribers(&self) -> usize {
        self.topics.iter().map(|t| t.subscribers).sum()
    }

    /// Number of topics with an open connection.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.topics.iter().filter(|t| t.state.is_open()).count()
    }

    /// Get statistics for one topic.
    #[must_use]
    pub fn topic(&self, topic: &str) -> Option<&TopicStats> {
        self.topics.iter().find(|t| t.topic.as_str() == topic)
    }
}

// =============================================================================
// Tests
// =============================================================================
