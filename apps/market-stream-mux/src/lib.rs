#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_truncation
    )
)]

//! Market Stream Mux - Streaming Subscription Multiplexer
//!
//! Maps many logical market data subscriptions onto one physical streaming
//! connection per topic. The first subscriber of a topic opens the
//! connection, every frame fans out to all current subscribers, failed
//! connections reconnect with bounded backoff while subscribers remain, and
//! the last unsubscribe closes the connection.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `topic`: Topic names
//!   - `streaming`: Normalized market data (trades, book events, candles)
//!   - `subscription`: Subscriber IDs, topic entries, connection state, stats
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Stream transport, frame decoder, stats source
//!   - `services`: Registry, connection epochs, reconnect policy, lifecycle,
//!     and the `Multiplexer` API
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `websocket`: One WebSocket per topic
//!   - `binance`: Binance stream decoder, REST client and venue adapter
//!   - `codec`: Generic JSON decoder
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!   - `metrics`, `telemetry`: Observability
//!
//! # Data Flow
//!
//! ```text
//!                      ┌──────────────────────────────┐
//! btcusdt@aggTrade WS ─┤ decode ─► handler 1, 2, ... N│
//! btcusdt@depth WS ────┤ decode ─► handler 1, 2, ... N│
//!                      └──────────────────────────────┘
//!                       one connection per topic
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no external dependencies.
pub mod domain;

/// Application layer - Multiplexer services and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{BookChange, BookEvent, BookLevel, BookSnapshot, Candle, Side, Trade};
pub use domain::subscription::{
    ConnectionState, HandlerError, MultiplexerStats, SubscriberId, TopicStats,
};
pub use domain::topic::Topic;

// Ports
pub use application::ports::{
    DecodeError, FrameDecoder, StatsSource, StreamTransport, TransportError, TransportSession,
};

// Multiplexer
pub use application::services::{
    ConnectionSettings, Multiplexer, MultiplexerConfig, MultiplexerError, ReconnectConfig,
    ShutdownSummary, SubscriptionHandle, SubscriptionStatus,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, MuxConfig};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
