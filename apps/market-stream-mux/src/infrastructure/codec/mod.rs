//! Generic JSON Frame Codec
//!
//! Decodes any JSON frame into a `serde_json::Value`. Used for topics that
//! have no venue-specific decoder, and as the baseline decoder in tests.

use serde_json::Value;

use crate::application::ports::{DecodeError, FrameDecoder};
use crate::domain::topic::Topic;

/// Decoder that yields raw JSON values.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDecoder;

impl JsonDecoder {
    /// Create a new JSON decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl FrameDecoder for JsonDecoder {
    type Message = Value;

    fn decode(&self, _topic: &Topic, frame: &[u8]) -> Result<Value, DecodeError> {
        Ok(serde_json::from_slice(frame)?)
    }
}
