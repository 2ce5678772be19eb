//! Binance REST Client
//!
//! Request/response collaborator for data the streams do not carry: recent
//! trade history, order book snapshots and historical candles.
//!
//! # Endpoints
//!
//! - `GET /aggTrades?symbol=BTCUSDT`
//! - `GET /depth?symbol=BTCUSDT`
//! - `GET /klines?symbol=BTCUSDT&interval=1m&startTime=..&endTime=..`

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::adapter::venue_symbol;
use super::messages::{DepthSnapshotResponse, RestAggTrade};
use crate::domain::streaming::{BookSnapshot, Candle, CandleRequest, Trade};

/// Default Binance spot REST base URL.
pub const DEFAULT_REST_BASE_URL: &str = "https://api.binance.com/api/v3";

/// Number of candles requested per `/klines` call, sent as `limit`.
pub const MAX_CANDLES_PER_REQUEST: usize = 500;

/// Supported candle widths, in milliseconds, and their interval codes.
const TIMEFRAMES: &[(u64, &str)] = &[
    (60_000, "1m"),
    (180_000, "3m"),
    (300_000, "5m"),
    (900_000, "15m"),
    (1_800_000, "30m"),
    (3_600_000, "1h"),
    (7_200_000, "2h"),
    (14_400_000, "4h"),
    (21_600_000, "6h"),
    (28_800_000, "8h"),
    (43_200_000, "12h"),
    (86_400_000, "1d"),
    (259_200_000, "3d"),
    (604_800_000, "1w"),
    (2_628_000_000, "1M"),
];

// =============================================================================
// Error Type
// =============================================================================

/// Errors from the REST client.
#[derive(Debug, thiserror::Error)]
pub enum RestError {
    /// The requested candle width has no Binance interval.
    #[error("unsupported timeframe: {0:?}")]
    UnsupportedTimeframe(Duration),

    /// Binance answered with a non-success status.
    #[error("API error {status}: {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The request could not be sent or the body could not be read.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The response body did not have the expected shape.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Map a candle width to its Binance interval code.
#[must_use]
pub fn interval_for(granularity: Duration) -> Option<&'static str> {
    let millis = granularity.as_millis();
    TIMEFRAMES
        .iter()
        .find(|(ms, _)| u128::from(*ms) == millis)
        .map(|(_, code)| *code)
}

// =============================================================================
// Client
// =============================================================================

/// Binance spot REST client.
#[derive(Debug, Clone)]
pub struct BinanceRestClient {
    client: Client,
    base_url: String,
}

impl BinanceRestClient {
    /// Create a client for `base_url` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `RestError::Http` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RestError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RestError::Http(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Largest number of candles a single `candles` call returns.
    #[must_use]
    pub const fn max_candles_per_request(&self) -> usize {
        MAX_CANDLES_PER_REQUEST
    }

    /// Recent aggregated trades for `symbol`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body is malformed.
    pub async fn history(&self, symbol: &str) -> Result<Vec<Trade>, RestError> {
        let trades: Vec<RestAggTrade> = self
            .get("/aggTrades", &[("symbol", venue_symbol(symbol))])
            .await?;
        Ok(trades.iter().map(RestAggTrade::to_trade).collect())
    }

    /// Current order book snapshot for `symbol`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body is malformed.
    pub async fn order_book_snapshot(&self, symbol: &str) -> Result<BookSnapshot, RestError> {
        let response: DepthSnapshotResponse = self
            .get("/depth", &[("symbol", venue_symbol(symbol))])
            .await?;
        Ok(response.into())
    }

    /// Historical candles for `request`.
    ///
    /// # Errors
    ///
    /// Returns `RestError::UnsupportedTimeframe` without sending anything if
    /// the granularity has no Binance interval, otherwise an error if the
    /// request fails or the body is malformed.
    pub async fn candles(&self, request: &CandleRequest) -> Result<Vec<Candle>, RestError> {
        let interval = interval_for(request.granularity)
            .ok_or(RestError::UnsupportedTimeframe(request.granularity))?;

        let rows: Vec<Vec<Value>> = self
            .get(
                "/klines",
                &[
                    ("startTime", request.start.timestamp_millis().to_string()),
                    ("endTime", request.end.timestamp_millis().to_string()),
                    ("interval", interval.to_string()),
                    ("limit", MAX_CANDLES_PER_REQUEST.to_string()),
                    ("symbol", venue_symbol(&request.symbol)),
                ],
            )
            .await?;

        rows.iter().map(|row| parse_kline(row)).collect()
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, RestError> {
        let url = format!("{}{path}", self.base_url);
        tracing::debug!(url = %url, "Binance REST request");

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| RestError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RestError::Http(e.to_string()))?;

        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), path, "Binance REST request failed");
            return Err(RestError::Api {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| RestError::Decode(e.to_string()))
    }
}

/// Parse one positional `/klines` row: `[openTime, open, high, low, close, volume, ...]`.
fn parse_kline(row: &[Value]) -> Result<Candle, RestError> {
    if row.len() < 6 {
        return Err(RestError::Decode(format!(
            "kline has {} fields, expected at least 6",
            row.len()
        )));
    }

    let open_time = row[0]
        .as_i64()
        .ok_or_else(|| RestError::Decode(format!("invalid kline open time: {}", row[0])))?;
    let date = DateTime::<Utc>::from_timestamp_millis(open_time)
        .ok_or_else(|| RestError::Decode(format!("kline open time out of range: {open_time}")))?;

    Ok(Candle {
        date,
        open: decimal_field(&row[1])?,
        high: decimal_field(&row[2])?,
        low: decimal_field(&row[3])?,
        close: decimal_field(&row[4])?,
        volume: decimal_field(&row[5])?,
    })
}

fn decimal_field(value: &Value) -> Result<Decimal, RestError> {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RestError::Decode(format!("invalid decimal: {value}")))
}

// =============================================================================
// Tests
// =============================================================================
