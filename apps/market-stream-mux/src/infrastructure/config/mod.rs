//! Configuration Module
//!
//! Configuration loading for the multiplexer service.

mod settings;

pub use settings::{ConfigError, MuxConfig, ServerSettings, VenueSettings, WebSocketSettings};
