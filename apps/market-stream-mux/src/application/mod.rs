//! Application Layer - Multiplexer services and port definitions.
//!
//! This layer contains the multiplexer core and the port interfaces it uses
//! to reach the streaming transport and the frame decoder.

/// Port interfaces for external systems (stream transport, frame decoding).
pub mod ports;

/// Multiplexer services: registry, connections, reconnect policy, lifecycle.
pub mod services;
