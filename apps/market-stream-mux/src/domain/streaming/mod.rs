//! Market Data Streaming Types
//!
//! Venue-agnostic market data: trades, order book events and candles.
//! Venue adapters normalize their wire messages into these types before
//! handing them to consumers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Trades
// =============================================================================

/// Aggressor side of a trade or the book side of a level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy side (bids).
    Buy,
    /// Sell side (asks).
    Sell,
}

impl Side {
    /// Get the side name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

/// A normalized trade print.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Trade time.
    pub date: DateTime<Utc>,
    /// Trade price.
    pub price: Decimal,
    /// Trade size.
    pub size: Decimal,
    /// Aggressor side.
    pub side: Side,
    /// Venue trade identifier.
    pub id: String,
}

// =============================================================================
// Order Book
// =============================================================================

/// A single price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Level price.
    pub price: Decimal,
    /// Resting size at the level (zero removes the level).
    pub size: Decimal,
}

/// One level change carried by an incremental book update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookChange {
    /// Book side of the change.
    pub side: Side,
    /// Level price.
    pub price: Decimal,
    /// New size at the level (zero removes the level).
    pub size: Decimal,
}

/// A full order book snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
    /// Venue sequence number the snapshot is consistent with.
    pub last_update_id: u64,
    /// Bid levels, best first.
    pub bids: Vec<BookLevel>,
    /// Ask levels, best first.
    pub asks: Vec<BookLevel>,
}

/// Order book event delivered to order book subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BookEvent {
    /// Full snapshot fetched over the request-response transport.
    Snapshot(BookSnapshot),
    /// Incremental level changes from the stream.
    Update {
        /// Level changes, bids first then asks.
        changes: Vec<BookChange>,
    },
}

// =============================================================================
// Candles
// =============================================================================

/// An OHLCV candle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Candle open time.
    pub date: DateTime<Utc>,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Traded volume.
    pub volume: Decimal,
}

/// Parameters of a historical candle request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandleRequest {
    /// Venue-agnostic symbol, e.g. `BTC-USDT`.
    pub symbol: String,
    /// Candle width.
    pub granularity: Duration,
    /// Inclusive range start.
    pub start: DateTime<Utc>,
    /// Inclusive range end.
    pub end: DateTime<Utc>,
}
