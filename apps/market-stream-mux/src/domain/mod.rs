//! Domain Layer - Core streaming types and subscription bookkeeping.
//!
//! This layer contains the venue-agnostic types for market data streaming
//! with no I/O. Everything here is plain Rust with serialization support.

/// Topic routing keys.
pub mod topic;

/// Normalized market data types (trades, order book events, candles).
pub mod streaming;

/// Subscriber sequences, connection states and statistics.
pub mod subscription;
