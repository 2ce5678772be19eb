//! Binance Venue Adapter
//!
//! Normalized market data for Binance spot symbols on top of the
//! multiplexer and the REST client. Symbols use the venue-agnostic
//! `BASE-QUOTE` form (`BTC-USDT`).
//!
//! | Operation    | Source                              |
//! |--------------|-------------------------------------|
//! | `trades`     | `<symbol>@aggTrade` stream          |
//! | `ticker`     | same as `trades`                    |
//! | `order_book` | `<symbol>@depth` stream + `/depth`  |
//! | `history`    | `/aggTrades`                        |
//! | `candles`    | `/klines`                           |

use std::sync::Arc;

use super::codec::BinanceDecoder;
use super::messages::BinanceMessage;
use super::rest::{BinanceRestClient, RestError};
use crate::application::services::multiplexer::{
    Multiplexer, MultiplexerError, SubscriptionHandle,
};
use crate::domain::streaming::{BookEvent, Candle, CandleRequest, Trade};
use crate::domain::subscription::HandlerError;
use crate::domain::topic::Topic;

// =============================================================================
// Symbol Mapping
// =============================================================================

/// Binance symbol for REST queries: `BTC-USDT` → `BTCUSDT`.
#[must_use]
pub fn venue_symbol(symbol: &str) -> String {
    symbol.split('-').collect::<String>().to_uppercase()
}

/// Binance symbol for stream names: `BTC-USDT` → `btcusdt`.
#[must_use]
pub fn stream_symbol(symbol: &str) -> String {
    symbol.split('-').collect::<String>().to_lowercase()
}

/// Aggregated trade topic for `symbol`.
#[must_use]
pub fn trades_topic(symbol: &str) -> Topic {
    Topic::new(format!("{}@aggTrade", stream_symbol(symbol)))
}

/// Order book diff topic for `symbol`.
#[must_use]
pub fn depth_topic(symbol: &str) -> Topic {
    Topic::new(format!("{}@depth", stream_symbol(symbol)))
}

// =============================================================================
// Adapter
// =============================================================================

/// Binance spot market data adapter.
#[derive(Debug, Clone)]
pub struct BinanceAdapter {
    mux: Multiplexer<BinanceDecoder>,
    rest: BinanceRestClient,
}

impl BinanceAdapter {
    /// Create an adapter over a multiplexer and a REST client.
    #[must_use]
    pub const fn new(mux: Multiplexer<BinanceDecoder>, rest: BinanceRestClient) -> Self {
        Self { mux, rest }
    }

    /// Underlying multiplexer.
    #[must_use]
    pub const fn multiplexer(&self) -> &Multiplexer<BinanceDecoder> {
        &self.mux
    }

    /// Subscribe to normalized trades for `symbol`.
    ///
    /// # Errors
    ///
    /// Returns `MultiplexerError::Closed` after shutdown.
    pub fn trades<F>(&self, symbol: &str, callback: F) -> Result<SubscriptionHandle, MultiplexerError>
    where
        F: Fn(&Trade) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.mux.subscribe(trades_topic(symbol), move |message| match message {
            BinanceMessage::AggTrade(trade) => callback(&trade.to_trade()),
            BinanceMessage::DepthUpdate(_) => Ok(()),
        })
    }

    /// Subscribe to ticker updates for `symbol`. Binance ticks on trades.
    ///
    /// # Errors
    ///
    /// Returns `MultiplexerError::Closed` after shutdown.
    pub fn ticker<F>(&self, symbol: &str, callback: F) -> Result<SubscriptionHandle, MultiplexerError>
    where
        F: Fn(&Trade) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.trades(symbol, callback)
    }

    /// Subscribe to order book events for `symbol`.
    ///
    /// Diffs arrive as `BookEvent::Update`. A REST snapshot is fetched in
    /// the background and delivered as `BookEvent::Snapshot` only if the
    /// subscription is still active when it arrives. The snapshot goes
    /// through the depth topic's dispatch gate, so `callback` never runs
    /// concurrently with itself. Snapshot failures are logged and never
    /// reach `callback`.
    ///
    /// # Errors
    ///
    /// Returns `MultiplexerError::Closed` after shutdown.
    pub fn order_book<F>(
        &self,
        symbol: &str,
        callback: F,
    ) -> Result<SubscriptionHandle, MultiplexerError>
    where
        F: Fn(&BookEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let on_update = Arc::clone(&callback);

        let handle = self.mux.subscribe(depth_topic(symbol), move |message| match message {
            BinanceMessage::DepthUpdate(update) => on_update(&BookEvent::Update {
                changes: update.changes(),
            }),
            BinanceMessage::AggTrade(_) => Ok(()),
        })?;

        let status = handle.status();
        let rest = self.rest.clone();
        let symbol = symbol.to_string();
        self.mux.spawn_background(async move {
            match rest.order_book_snapshot(&symbol).await {
                Ok(snapshot) => {
                    let event = BookEvent::Snapshot(snapshot);
                    if status.deliver(|| callback(&event)).is_none() {
                        tracing::debug!(symbol = %symbol, "Discarding snapshot for closed subscription");
                    }
                }
                Err(e) => {
                    tracing::warn!(symbol = %symbol, error = %e, "Order book snapshot failed");
                }
            }
        });

        Ok(handle)
    }

    /// Recent trades for `symbol`.
    ///
    /// # Errors
    ///
    /// Returns an error if the REST request fails.
    pub async fn history(&self, symbol: &str) -> Result<Vec<Trade>, RestError> {
        self.rest.history(symbol).await
    }

    /// Historical candles.
    ///
    /// # Errors
    ///
    /// Returns `RestError::UnsupportedTimeframe` for widths Binance does not
    /// offer, or an error if the REST request fails.
    pub async fn candles(&self, request: &CandleRequest) -> Result<Vec<Candle>, RestError> {
        self.rest.candles(request).await
    }

    /// Largest number of candles one `candles` call returns.
    #[must_use]
    pub const fn max_candles_per_request(&self) -> usize {
        self.rest.max_candles_per_request()
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("BTC-USDT", "BTCUSDT", "btcusdt")]
    #[test_case("eth-btc", "ETHBTC", "ethbtc")]
    #[test_case("BNBUSDT", "BNBUSDT", "bnbusdt" ; "already joined")]
    fn symbol_mapping(symbol: &str, venue: &str, stream: &str) {
        assert_eq!(venue_symbol(symbol), venue);
        assert_eq!(stream_symbol(symbol), stream);
    }

    #[test]
    fn topics_follow_binance_stream_names() {
        assert_eq!(trades_topic("BTC-USDT").as_str(), "btcusdt@aggTrade");
        assert_eq!(depth_topic("BTC-USDT").as_str(), "btcusdt@depth");
    }
}
