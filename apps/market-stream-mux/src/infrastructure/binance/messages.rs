//! Binance Wire Message Types
//!
//! Wire format types for the Binance spot raw streams and the REST
//! endpoints the adapter uses. Field names follow Binance's single-letter
//! keys; prices and quantities arrive as decimal strings.
//!
//! # Stream Events
//! - `aggTrade`: Aggregated trade (`<symbol>@aggTrade`)
//! - `depthUpdate`: Incremental order book diff (`<symbol>@depth`)
//!
//! # REST Payloads
//! - `/aggTrades`: Recent aggregated trades
//! - `/depth`: Order book snapshot
//! - `/klines`: Candles, as positional arrays
//!
//! # References
//!
//! - [WebSocket Streams](https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams)
//! - [Market Data Endpoints](https://developers.binance.com/docs/binance-spot-api-docs/rest-api/market-data-endpoints)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::streaming::{BookChange, BookLevel, BookSnapshot, Side, Trade};

// =============================================================================
// Stream Events
// =============================================================================

/// Decoded Binance stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinanceMessage {
    /// Aggregated trade.
    AggTrade(AggTradeMessage),
    /// Order book diff.
    DepthUpdate(DepthUpdateMessage),
}

/// Aggregated trade event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggTradeMessage {
    /// Event type (always "aggTrade")
    #[serde(rename = "e")]
    pub event_type: String,

    /// Event time
    #[serde(rename = "E", with = "chrono::serde::ts_milliseconds")]
    pub event_time: DateTime<Utc>,

    /// Symbol (e.g., "BTCUSDT")
    #[serde(rename = "s")]
    pub symbol: String,

    /// Aggregate trade ID
    #[serde(rename = "a")]
    pub agg_trade_id: u64,

    /// Price
    #[serde(rename = "p")]
    pub price: Decimal,

    /// Quantity
    #[serde(rename = "q")]
    pub quantity: Decimal,

    /// First trade ID in the aggregate
    #[serde(rename = "f", default)]
    pub first_trade_id: u64,

    /// Last trade ID in the aggregate
    #[serde(rename = "l", default)]
    pub last_trade_id: u64,

    /// Trade time
    #[serde(rename = "T", with = "chrono::serde::ts_milliseconds")]
    pub trade_time: DateTime<Utc>,

    /// Buyer is the market maker (the aggressor sold)
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
}

impl AggTradeMessage {
    /// Normalize into a `Trade`, dated by event time.
    #[must_use]
    pub fn to_trade(&self) -> Trade {
        Trade {
            date: self.event_time,
            price: self.price,
            size: self.quantity,
            side: aggressor_side(self.buyer_is_maker),
            id: self.agg_trade_id.to_string(),
        }
    }
}

/// Order book diff event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthUpdateMessage {
    /// Event type (always "depthUpdate")
    #[serde(rename = "e")]
    pub event_type: String,

    /// Event time
    #[serde(rename = "E", with = "chrono::serde::ts_milliseconds")]
    pub event_time: DateTime<Utc>,

    /// Symbol (e.g., "BTCUSDT")
    #[serde(rename = "s")]
    pub symbol: String,

    /// First update ID in the event
    #[serde(rename = "U")]
    pub first_update_id: u64,

    /// Final update ID in the event
    #[serde(rename = "u")]
    pub final_update_id: u64,

    /// Bid levels to update, as `[price, quantity]`
    #[serde(rename = "b", default)]
    pub bids: Vec<(Decimal, Decimal)>,

    /// Ask levels to update, as `[price, quantity]`
    #[serde(rename = "a", default)]
    pub asks: Vec<(Decimal, Decimal)>,
}

impl DepthUpdateMessage {
    /// Flatten into book changes: bids first, then asks.
    #[must_use]
    pub fn changes(&self) -> Vec<BookChange> {
        let bids = self.bids.iter().map(|&(price, size)| BookChange {
            side: Side::Buy,
            price,
            size,
        });
        let asks = self.asks.iter().map(|&(price, size)| BookChange {
            side: Side::Sell,
            price,
            size,
        });
        bids.chain(asks).collect()
    }
}

const fn aggressor_side(buyer_is_maker: bool) -> Side {
    if buyer_is_maker { Side::Sell } else { Side::Buy }
}

// =============================================================================
// REST Payloads
// =============================================================================

/// Entry of the `/aggTrades` response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RestAggTrade {
    /// Aggregate trade ID
    #[serde(rename = "a")]
    pub agg_trade_id: u64,

    /// Price
    #[serde(rename = "p")]
    pub price: Decimal,

    /// Quantity
    #[serde(rename = "q")]
    pub quantity: Decimal,

    /// Trade time
    #[serde(rename = "T", with = "chrono::serde::ts_milliseconds")]
    pub trade_time: DateTime<Utc>,

    /// Buyer is the market maker
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
}

impl RestAggTrade {
    /// Normalize into a `Trade`, dated by trade time.
    #[must_use]
    pub fn to_trade(&self) -> Trade {
        Trade {
            date: self.trade_time,
            price: self.price,
            size: self.quantity,
            side: aggressor_side(self.buyer_is_maker),
            id: self.agg_trade_id.to_string(),
        }
    }
}

/// `/depth` response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthSnapshotResponse {
    /// Update ID the snapshot is consistent with
    pub last_update_id: u64,

    /// Bid levels, best first
    pub bids: Vec<(Decimal, Decimal)>,

    /// Ask levels, best first
    pub asks: Vec<(Decimal, Decimal)>,
}

impl From<DepthSnapshotResponse> for BookSnapshot {
    fn from(response: DepthSnapshotResponse) -> Self {
        let level = |(price, size): (Decimal, Decimal)| BookLevel { price, size };
        Self {
            last_update_id: response.last_update_id,
            bids: response.bids.into_iter().map(level).collect(),
            asks: response.asks.into_iter().map(level).collect(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
