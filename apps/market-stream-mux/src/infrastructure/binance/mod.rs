//! Binance Spot Adapters
//!
//! Market data from Binance's public spot API:
//!
//! - **Streams**: Aggregated trades and depth diffs over raw WebSocket streams
//! - **REST**: Trade history, order book snapshots and candles

pub mod adapter;
pub mod codec;
pub mod messages;
pub mod rest;

pub use adapter::{BinanceAdapter, depth_topic, stream_symbol, trades_topic, venue_symbol};
pub use codec::BinanceDecoder;
pub use messages::{AggTradeMessage, BinanceMessage, DepthUpdateMessage};
pub use rest::{
    BinanceRestClient, DEFAULT_REST_BASE_URL, MAX_CANDLES_PER_REQUEST, RestError, interval_for,
};
