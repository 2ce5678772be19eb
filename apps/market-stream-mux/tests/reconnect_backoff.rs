//! Reconnect timing under a paused clock.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Log, Plan, ScriptedTransport, wait_until};
use market_stream_mux::infrastructure::codec::JsonDecoder;
use market_stream_mux::{
    ConnectionSettings, HandlerError, Multiplexer, MultiplexerConfig, ReconnectConfig,
};
use serde_json::Value;
use tokio::time::Instant;

const TOPIC: &str = "btcusdt@trades";
const LIMIT: Duration = Duration::from_secs(60);

fn mux(transport: &ScriptedTransport, idle_timeout: Option<Duration>) -> Multiplexer<JsonDecoder> {
    let config = MultiplexerConfig {
        reconnect: ReconnectConfig::new(
            Duration::from_millis(100),
            Duration::from_millis(250),
            2.0,
            0.0,
        ),
        connection: ConnectionSettings {
            connect_timeout: Duration::from_secs(1),
            idle_timeout,
            close_timeout: Duration::from_secs(1),
        },
    };
    Multiplexer::new(Arc::new(transport.clone()), JsonDecoder::new(), config)
}

fn counting(log: &Log<i64>) -> impl Fn(&Value) -> Result<(), HandlerError> + Send + Sync + 'static {
    let log = log.clone();
    move |message: &Value| {
        log.push(message["n"].as_i64().unwrap_or(-1));
        Ok(())
    }
}

fn gaps(times: &[Instant]) -> Vec<Duration> {
    times.windows(2).map(|w| w[1] - w[0]).collect()
}

#[tokio::test(start_paused = true)]
async fn three_failures_back_off_and_cap() {
    let transport = ScriptedTransport::new();
    transport.script(TOPIC, &[Plan::Refuse, Plan::Refuse, Plan::Refuse, Plan::Open]);
    let mux = mux(&transport, None);
    let log = Log::new();

    let _a = mux.subscribe(TOPIC, counting(&log)).unwrap();
    wait_until(LIMIT, || transport.live(TOPIC) == 1).await;

    assert_eq!(transport.connect_count(TOPIC), 4);
    assert_eq!(
        gaps(&transport.connect_times(TOPIC)),
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(250),
        ]
    );
    assert_eq!(mux.stats().topic(TOPIC).unwrap().reconnects, 3);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.connect_count(TOPIC), 4);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_during_backoff_cancels_retry() {
    let transport = ScriptedTransport::new();
    transport.script(TOPIC, &[Plan::Refuse; 10]);
    let mux = mux(&transport, None);
    let log = Log::new();

    let a = mux.subscribe(TOPIC, counting(&log)).unwrap();
    wait_until(LIMIT, || transport.connect_count(TOPIC) == 2).await;

    assert!(a.dispose());
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(transport.connect_count(TOPIC), 2);
    assert_eq!(mux.connection_state(TOPIC), None);
    assert!(mux.stats().topics.is_empty());
}

#[tokio::test(start_paused = true)]
async fn healthy_epoch_resets_backoff() {
    let transport = ScriptedTransport::new();
    transport.script(TOPIC, &[Plan::Refuse, Plan::Refuse, Plan::Open, Plan::Open]);
    let mux = mux(&transport, None);
    let log = Log::new();

    let _a = mux.subscribe(TOPIC, counting(&log)).unwrap();
    wait_until(LIMIT, || transport.live(TOPIC) == 1).await;
    assert_eq!(transport.connect_count(TOPIC), 3);

    transport.push_frame(TOPIC, r#"{"n":1}"#);
    wait_until(LIMIT, || log.len() == 1).await;

    let failed_at = Instant::now();
    transport.fail(TOPIC, "reset by peer");
    wait_until(LIMIT, || transport.connect_count(TOPIC) == 4).await;

    let reconnected_at = *transport.connect_times(TOPIC).last().unwrap();
    assert_eq!(reconnected_at - failed_at, Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn idle_stream_is_treated_as_failure() {
    let transport = ScriptedTransport::new();
    let mux = mux(&transport, Some(Duration::from_secs(1)));
    let log = Log::new();

    let _a = mux.subscribe(TOPIC, counting(&log)).unwrap();
    wait_until(LIMIT, || transport.connect_count(TOPIC) == 2).await;

    assert_eq!(
        gaps(&transport.connect_times(TOPIC)),
        vec![Duration::from_millis(1100)]
    );
    assert_eq!(transport.closes(TOPIC), 1);
}
