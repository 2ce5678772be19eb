//! Multiplexer Configuration Settings
//!
//! Configuration types for the multiplexer service, loaded from
//! `STREAM_MUX_*` environment variables.

use std::time::Duration;

use crate::application::services::connection::ConnectionSettings;
use crate::application::services::multiplexer::MultiplexerConfig;
use crate::application::services::reconnect::ReconnectConfig;
use crate::infrastructure::binance::DEFAULT_REST_BASE_URL;

/// Default Binance raw stream base URL.
pub const DEFAULT_WS_BASE_URL: &str = "wss://stream.binance.com:9443/ws";

/// Venue endpoints.
#[derive(Debug, Clone)]
pub struct VenueSettings {
    /// Base URL topic streams are appended to.
    pub ws_base_url: String,
    /// REST API base URL.
    pub rest_base_url: String,
    /// Per-request REST timeout.
    pub rest_timeout: Duration,
}

impl Default for VenueSettings {
    fn default() -> Self {
        Self {
            ws_base_url: DEFAULT_WS_BASE_URL.to_string(),
            rest_base_url: DEFAULT_REST_BASE_URL.to_string(),
            rest_timeout: Duration::from_secs(10),
        }
    }
}

/// WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Upper bound on establishing a connection.
    pub connect_timeout: Duration,
    /// Silence after which a stream is considered dead (zero = disabled).
    pub idle_timeout: Duration,
    /// Upper bound on a graceful close.
    pub close_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Upward jitter as a fraction of the delay.
    pub reconnect_jitter: f64,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(5),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            reconnect_jitter: 0.0,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8082 }
    }
}

/// Complete multiplexer service configuration.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Symbols to stream, in `BASE-QUOTE` form.
    pub symbols: Vec<String>,
    /// Venue endpoints.
    pub venue: VenueSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// WebSocket connection settings.
    pub websocket: WebSocketSettings,
}

impl MuxConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `STREAM_MUX_SYMBOLS` is missing or empty, or if a
    /// numeric variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`MuxConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let raw_symbols = env
            .get("STREAM_MUX_SYMBOLS")
            .ok_or_else(|| ConfigError::MissingEnvVar("STREAM_MUX_SYMBOLS".to_string()))?;
        let symbols: Vec<String> = raw_symbols
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_uppercase)
            .collect();
        if symbols.is_empty() {
            return Err(ConfigError::EmptyValue("STREAM_MUX_SYMBOLS".to_string()));
        }

        let venue_defaults = VenueSettings::default();
        let venue = VenueSettings {
            ws_base_url: env
                .get("STREAM_MUX_WS_BASE_URL")
                .unwrap_or(venue_defaults.ws_base_url),
            rest_base_url: env
                .get("STREAM_MUX_REST_BASE_URL")
                .unwrap_or(venue_defaults.rest_base_url),
            rest_timeout: env
                .duration_secs("STREAM_MUX_REST_TIMEOUT_SECS", venue_defaults.rest_timeout)?,
        };

        let server = ServerSettings {
            health_port: env.parse(
                "STREAM_MUX_HEALTH_PORT",
                ServerSettings::default().health_port,
            )?,
        };

        let ws_defaults = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            connect_timeout: env.duration_secs(
                "STREAM_MUX_CONNECT_TIMEOUT_SECS",
                ws_defaults.connect_timeout,
            )?,
            idle_timeout: env
                .duration_secs("STREAM_MUX_IDLE_TIMEOUT_SECS", ws_defaults.idle_timeout)?,
            close_timeout: env
                .duration_secs("STREAM_MUX_CLOSE_TIMEOUT_SECS", ws_defaults.close_timeout)?,
            reconnect_delay_initial: env.duration_millis(
                "STREAM_MUX_RECONNECT_DELAY_INITIAL_MS",
                ws_defaults.reconnect_delay_initial,
            )?,
            reconnect_delay_max: env.duration_secs(
                "STREAM_MUX_RECONNECT_DELAY_MAX_SECS",
                ws_defaults.reconnect_delay_max,
            )?,
            reconnect_delay_multiplier: env.parse(
                "STREAM_MUX_RECONNECT_DELAY_MULTIPLIER",
                ws_defaults.reconnect_delay_multiplier,
            )?,
            reconnect_jitter: env
                .parse("STREAM_MUX_RECONNECT_JITTER", ws_defaults.reconnect_jitter)?,
        };

        Ok(Self {
            symbols,
            venue,
            server,
            websocket,
        })
    }

    /// Multiplexer configuration derived from the WebSocket settings.
    #[must_use]
    pub fn multiplexer_config(&self) -> MultiplexerConfig {
        let ws = &self.websocket;
        MultiplexerConfig {
            reconnect: ReconnectConfig::new(
                ws.reconnect_delay_initial,
                ws.reconnect_delay_max,
                ws.reconnect_delay_multiplier,
                ws.reconnect_jitter,
            ),
            connection: ConnectionSettings {
                connect_timeout: ws.connect_timeout,
                idle_timeout: (!ws.idle_timeout.is_zero()).then_some(ws.idle_timeout),
                close_timeout: ws.close_timeout,
            },
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        }
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse::<u64>(key, default.as_secs())
            .map(Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default_millis = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse::<u64>(key, default_millis)
            .map(Duration::from_millis)
    }
}
