//! Market Stream Mux Binary
//!
//! Streams normalized trades and order book events for the configured
//! Binance symbols through the subscription multiplexer.
//!
//! # Usage
//!
//! ```bash
//! STREAM_MUX_SYMBOLS=BTC-USDT,ETH-USDT cargo run --bin market-stream-mux
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `STREAM_MUX_SYMBOLS`: Comma separated symbols, e.g. `BTC-USDT,ETH-USDT`
//!
//! ## Optional
//! - `STREAM_MUX_WS_BASE_URL`: Raw stream base URL (default: `wss://stream.binance.com:9443/ws`)
//! - `STREAM_MUX_REST_BASE_URL`: REST base URL (default: `https://api.binance.com/api/v3`)
//! - `STREAM_MUX_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `STREAM_MUX_RECONNECT_DELAY_INITIAL_MS`: First reconnect delay (default: 500)
//! - `STREAM_MUX_RECONNECT_DELAY_MAX_SECS`: Reconnect delay cap (default: 30)
//! - `STREAM_MUX_RECONNECT_DELAY_MULTIPLIER`: Backoff growth (default: 2.0)
//! - `STREAM_MUX_RECONNECT_JITTER`: Upward jitter fraction (default: 0.0)
//! - `STREAM_MUX_CONNECT_TIMEOUT_SECS`: Connect timeout (default: 10)
//! - `STREAM_MUX_IDLE_TIMEOUT_SECS`: Idle stream timeout, 0 disables (default: 60)
//! - `STREAM_MUX_CLOSE_TIMEOUT_SECS`: Graceful close timeout (default: 5)
//! - `STREAM_MUX_REST_TIMEOUT_SECS`: REST request timeout (default: 10)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-stream-mux)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use market_stream_mux::application::ports::StatsSource;
use market_stream_mux::domain::streaming::BookEvent;
use market_stream_mux::infrastructure::binance::{BinanceAdapter, BinanceDecoder, BinanceRestClient};
use market_stream_mux::infrastructure::health::{HealthServer, HealthServerState};
use market_stream_mux::infrastructure::telemetry;
use market_stream_mux::infrastructure::websocket::WebSocketTransport;
use market_stream_mux::{Multiplexer, MuxConfig, SubscriptionHandle, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Err means a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Stream Mux");

    // Initialize Prometheus metrics
    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = MuxConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Multiplexer over one WebSocket per topic
    let transport = Arc::new(WebSocketTransport::new(config.venue.ws_base_url.clone()));
    let mux = Multiplexer::new(transport, BinanceDecoder::new(), config.multiplexer_config());

    let rest = BinanceRestClient::new(config.venue.rest_base_url.clone(), config.venue.rest_timeout)?;
    let adapter = BinanceAdapter::new(mux.clone(), rest);

    // Health server
    let stats: Arc<dyn StatsSource> = Arc::new(mux.clone());
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        stats,
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let handles = subscribe_symbols(&adapter, &config.symbols)?;
    tracing::info!(
        symbols = config.symbols.len(),
        subscriptions = handles.len(),
        "Market stream mux ready"
    );

    await_shutdown(shutdown_token).await;

    for handle in &handles {
        handle.dispose();
    }
    let summary = mux.shutdown();
    tracing::info!(
        topics = summary.topics,
        subscribers = summary.subscribers,
        "Multiplexer stopped"
    );

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, mux.closed()).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Connections did not close before timeout"
        );
    }

    tracing::info!("Market stream mux stopped");
    Ok(())
}

/// Subscribe to trades and order book events for every symbol.
fn subscribe_symbols(
    adapter: &BinanceAdapter,
    symbols: &[String],
) -> Result<Vec<SubscriptionHandle>, Box<dyn std::error::Error>> {
    let mut handles = Vec::with_capacity(symbols.len() * 2);

    for symbol in symbols {
        let trade_symbol = symbol.clone();
        handles.push(adapter.trades(symbol, move |trade| {
            tracing::info!(
                symbol = %trade_symbol,
                price = %trade.price,
                size = %trade.size,
                side = trade.side.as_str(),
                id = %trade.id,
                "Trade"
            );
            Ok(())
        })?);

        let book_symbol = symbol.clone();
        handles.push(adapter.order_book(symbol, move |event| {
            match event {
                BookEvent::Snapshot(snapshot) => tracing::info!(
                    symbol = %book_symbol,
                    last_update_id = snapshot.last_update_id,
                    bids = snapshot.bids.len(),
                    asks = snapshot.asks.len(),
                    "Order book snapshot"
                ),
                BookEvent::Update { changes } => tracing::debug!(
                    symbol = %book_symbol,
                    changes = changes.len(),
                    "Order book update"
                ),
            }
            Ok(())
        })?);
    }

    Ok(handles)
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &MuxConfig) {
    tracing::info!(
        symbols = ?config.symbols,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        ws_base_url = %config.venue.ws_base_url,
        rest_base_url = %config.venue.rest_base_url,
        connect_timeout_secs = config.websocket.connect_timeout.as_secs(),
        idle_timeout_secs = config.websocket.idle_timeout.as_secs(),
        "Venue endpoints"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
