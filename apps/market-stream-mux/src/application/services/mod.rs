//! Application Services
//!
//! The multiplexer core and the pieces it is assembled from.
//!
//! - `registry`: Topic to subscriber map, dispatch and slot lifecycle
//! - `connection`: One physical connection epoch for a topic
//! - `reconnect`: Capped exponential backoff between epochs
//! - `lifecycle`: Root cancellation and task tracking for shutdown
//! - `multiplexer`: Public subscribe/unsubscribe/shutdown API

/// Connection epoch runner.
pub mod connection;

/// Root cancellation and tracked task spawning.
pub mod lifecycle;

/// Public multiplexer API and topic supervisors.
pub mod multiplexer;

/// Reconnection backoff policy.
pub mod reconnect;

/// Subscription registry and topic slots.
pub mod registry;

pub use connection::{ConnectionSettings, EpochEnd, EpochReport, TopicConnection};
pub use lifecycle::{LifecycleController, ShutdownSummary};
pub use multiplexer::{
    Multiplexer, MultiplexerConfig, MultiplexerError, SubscriptionHandle, SubscriptionStatus,
};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use registry::{Handler, SubscriptionRegistry, TopicSlot, handler};
