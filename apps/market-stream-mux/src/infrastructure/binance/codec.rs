//! Binance Stream Codec
//!
//! Decodes raw-stream frames into `BinanceMessage`. The event type is read
//! from the `e` field. Frames from combined streams arrive wrapped as
//! `{"stream": "...", "data": {...}}` and are unwrapped first.

use serde_json::Value;

use super::messages::{AggTradeMessage, BinanceMessage, DepthUpdateMessage};
use crate::application::ports::{DecodeError, FrameDecoder};
use crate::domain::topic::Topic;

/// Frame decoder for Binance spot streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinanceDecoder;

impl BinanceDecoder {
    /// Create a new decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl FrameDecoder for BinanceDecoder {
    type Message = BinanceMessage;

    fn decode(&self, _topic: &Topic, frame: &[u8]) -> Result<BinanceMessage, DecodeError> {
        let mut value: Value = serde_json::from_slice(frame)?;

        if let Some(data) = value.get_mut("data") {
            value = data.take();
        }

        let event = match value.get("e") {
            Some(Value::String(event)) => event.clone(),
            Some(other) => {
                return Err(DecodeError::InvalidFormat(format!(
                    "event type is not a string: {other}"
                )));
            }
            None => return Err(DecodeError::InvalidFormat("missing event type".into())),
        };

        match event.as_str() {
            "aggTrade" => {
                let m: AggTradeMessage = serde_json::from_value(value)?;
                Ok(BinanceMessage::AggTrade(m))
            }
            "depthUpdate" => {
                let m: DepthUpdateMessage = serde_json::from_value(value)?;
                Ok(BinanceMessage::DepthUpdate(m))
            }
            _ => Err(DecodeError::UnknownEvent(event)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(frame: &str) -> Result<BinanceMessage, DecodeError> {
        BinanceDecoder::new().decode(&Topic::new("btcusdt@aggTrade"), frame.as_bytes())
    }

    #[test]
    fn decodes_agg_trade() {
        let msg = decode(
            r#"{"e":"aggTrade","E":1,"s":"BTCUSDT","a":7,"p":"1.5","q":"2","f":1,"l":1,"T":1,"m":false,"M":true}"#,
        )
        .unwrap();
        let BinanceMessage::AggTrade(trade) = msg else {
            panic!("expected aggTrade, got {msg:?}");
        };
        assert_eq!(trade.agg_trade_id, 7);
    }

    #[test]
    fn decodes_depth_update() {
        let msg =
            decode(r#"{"e":"depthUpdate","E":1,"s":"BTCUSDT","U":1,"u":2,"b":[],"a":[]}"#).unwrap();
        assert!(matches!(msg, BinanceMessage::DepthUpdate(_)));
    }

    #[test]
    fn unwraps_combined_stream_envelope() {
        let msg = decode(
            r#"{"stream":"btcusdt@depth","data":{"e":"depthUpdate","E":1,"s":"BTCUSDT","U":1,"u":2,"b":[],"a":[]}}"#,
        )
        .unwrap();
        assert!(matches!(msg, BinanceMessage::DepthUpdate(_)));
    }

    #[test]
    fn unknown_event_is_rejected() {
        let err = decode(r#"{"e":"kline","E":1}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownEvent(e) if e == "kline"));
    }

    #[test]
    fn missing_event_type_is_invalid() {
        let err = decode(r#"{"result":null,"id":1}"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidFormat(_)));
    }

    #[test]
    fn malformed_payload_is_json_error() {
        let err = decode(r#"{"e":"aggTrade","p":"not a number"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }
}
