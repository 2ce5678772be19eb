//! Shared test fixtures: an in-memory, scriptable stream transport.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use market_stream_mux::{StreamTransport, Topic, TransportError, TransportSession};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// What the next connection attempt for a topic does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Fail to connect.
    Refuse,
    /// Open a session.
    Open,
}

enum Event {
    Frame(Vec<u8>),
    Fail(String),
    RemoteClose,
}

#[derive(Default)]
struct TopicScript {
    plans: VecDeque<Plan>,
    connects: Vec<Instant>,
    sessions: Vec<mpsc::UnboundedSender<Event>>,
    live: usize,
    max_live: usize,
    closes: usize,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicScript>,
}

/// Stream transport driven by the test. Unscripted connects open a session.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<State>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, topic: &str, plans: &[Plan]) {
        let mut state = self.state.lock();
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .plans
            .extend(plans.iter().copied());
    }

    pub fn connect_count(&self, topic: &str) -> usize {
        self.with_topic(topic, |t| t.connects.len())
    }

    pub fn connect_times(&self, topic: &str) -> Vec<Instant> {
        self.with_topic(topic, |t| t.connects.clone())
    }

    pub fn live(&self, topic: &str) -> usize {
        self.with_topic(topic, |t| t.live)
    }

    pub fn max_live(&self, topic: &str) -> usize {
        self.with_topic(topic, |t| t.max_live)
    }

    pub fn closes(&self, topic: &str) -> usize {
        self.with_topic(topic, |t| t.closes)
    }

    /// Deliver a frame on the latest session. Returns `false` if none exists.
    pub fn push_frame(&self, topic: &str, frame: &str) -> bool {
        self.send(topic, Event::Frame(frame.as_bytes().to_vec()))
    }

    /// Fail the latest session with a stream error.
    pub fn fail(&self, topic: &str, reason: &str) -> bool {
        self.send(topic, Event::Fail(reason.to_string()))
    }

    /// End the latest session from the remote side.
    pub fn remote_close(&self, topic: &str) -> bool {
        self.send(topic, Event::RemoteClose)
    }

    fn send(&self, topic: &str, event: Event) -> bool {
        let state = self.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|t| t.sessions.last())
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    fn with_topic<T: Default>(&self, topic: &str, f: impl FnOnce(&TopicScript) -> T) -> T {
        self.state.lock().topics.get(topic).map(f).unwrap_or_default()
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn connect(&self, topic: &Topic) -> Result<Box<dyn TransportSession>, TransportError> {
        let mut state = self.state.lock();
        let script = state.topics.entry(topic.to_string()).or_default();
        script.connects.push(Instant::now());

        match script.plans.pop_front().unwrap_or(Plan::Open) {
            Plan::Refuse => Err(TransportError::ConnectionFailed("refused".into())),
            Plan::Open => {
                let (tx, rx) = mpsc::unbounded_channel();
                script.sessions.push(tx);
                script.live += 1;
                script.max_live = script.max_live.max(script.live);
                Ok(Box::new(ScriptedSession {
                    topic: topic.to_string(),
                    rx,
                    state: Arc::clone(&self.state),
                }))
            }
        }
    }
}

struct ScriptedSession {
    topic: String,
    rx: mpsc::UnboundedReceiver<Event>,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl TransportSession for ScriptedSession {
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        match self.rx.recv().await? {
            Event::Frame(frame) => Some(Ok(frame)),
            Event::Fail(reason) => Some(Err(TransportError::Stream(reason))),
            Event::RemoteClose => None,
        }
    }

    async fn close(&mut self) {
        if let Some(script) = self.state.lock().topics.get_mut(&self.topic) {
            script.closes += 1;
        }
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        if let Some(script) = self.state.lock().topics.get_mut(&self.topic) {
            script.live -= 1;
        }
    }
}

/// Poll `condition` until it holds, panicking after `limit`.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {limit:?}");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Shared, ordered record of what handlers saw.
#[derive(Clone, Default)]
pub struct Log<T> {
    entries: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> Log<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, entry: T) {
        self.entries.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<T> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
