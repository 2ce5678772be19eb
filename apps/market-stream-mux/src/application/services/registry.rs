//! Subscription Registry
//!
//! Maps each topic to its slot: the ordered subscriber sequence plus the
//! state of the one physical connection serving it.
//!
//! # Invariants
//!
//! - A topic has a live slot if and only if it has at least one subscriber
//! - At most one physical connection per topic: a slot created while its
//!   predecessor is still draining waits for the predecessor to finish
//! - Dispatch for one topic never overlaps itself; different topics
//!   dispatch independently
//!
//! # Locking
//!
//! The topic map lock is only held for lookup, insert and removal. Each slot
//! has its own state mutex for subscriber mutation and a dispatch gate held
//! while handlers run, which lets shutdown wait out in-flight dispatch.
//! Out-of-band deliveries to a single subscriber take the same gate.
//! Lock order is map -> state and gate -> state; the state mutex is never
//! held while taking another lock or calling a handler.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::multiplexer::MultiplexerError;
use crate::domain::subscription::{
    ConnectionState, HandlerError, MultiplexerStats, SubscriberId, TopicEntry, TopicStats,
};
use crate::domain::topic::Topic;
use crate::infrastructure::metrics::{self, HandlerFailure};

/// Subscriber callback invoked for every message on its topic.
pub type Handler<M> = Arc<dyn Fn(&M) -> Result<(), HandlerError> + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<M, F>(f: F) -> Handler<M>
where
    F: Fn(&M) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

// =============================================================================
// Dispatch Scope
// =============================================================================

static NEXT_SLOT_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Keys of the slots whose dispatch gate this thread currently holds.
    static HELD_GATES: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Marks the current thread as holding one slot's dispatch gate.
struct DispatchScope {
    key: u64,
}

impl DispatchScope {
    fn enter(key: u64) -> Self {
        HELD_GATES.with(|held| held.borrow_mut().push(key));
        Self { key }
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        HELD_GATES.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|key| *key == self.key) {
                held.remove(pos);
            }
        });
    }
}

/// Whether the current thread holds the dispatch gate of slot `key`.
fn holds_gate(key: u64) -> bool {
    HELD_GATES.with(|held| held.borrow().contains(&key))
}

// =============================================================================
// Topic Slot
// =============================================================================

/// Result of dispatching one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

#[derive(Debug, Default)]
struct SlotCounters {
    frames_received: AtomicU64,
    decode_errors: AtomicU64,
    handler_errors: AtomicU64,
    reconnects: AtomicU64,
}

struct SlotState<M> {
    entry: TopicEntry<Handler<M>>,
    retired: bool,
    connection: ConnectionState,
}

/// Registry entry for one topic and the connection serving it.
///
/// A slot is retired exactly once, when its last subscriber leaves or the
/// multiplexer shuts down. A retired slot never dispatches again and is
/// never reused; a later subscriber gets a fresh slot.
pub struct TopicSlot<M> {
    key: u64,
    topic: Topic,
    gate: Mutex<()>,
    state: Mutex<SlotState<M>>,
    cancel: CancellationToken,
    done: CancellationToken,
    counters: SlotCounters,
}

impl<M> TopicSlot<M> {
    fn new(topic: Topic, cancel: CancellationToken) -> Self {
        Self {
            key: NEXT_SLOT_KEY.fetch_add(1, Ordering::Relaxed),
            topic,
            gate: Mutex::new(()),
            state: Mutex::new(SlotState {
                entry: TopicEntry::new(),
                retired: false,
                connection: ConnectionState::Idle,
            }),
            cancel,
            done: CancellationToken::new(),
            counters: SlotCounters::default(),
        }
    }

    /// Get the topic.
    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Token cancelled when the slot is retired.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Token cancelled once the slot's connection task has exited.
    #[must_use]
    pub const fn done_token(&self) -> &CancellationToken {
        &self.done
    }

    /// Check if the slot has been retired.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    /// Record a connection state transition.
    pub fn set_connection_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if state.connection != next {
            tracing::debug!(
                topic = %self.topic,
                from = state.connection.as_str(),
                to = next.as_str(),
                "Connection state changed"
            );
            state.connection = next;
        }
    }

    /// Number of current subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().entry.len()
    }

    /// Check if `id` is a current subscriber of this slot.
    #[must_use]
    pub fn is_subscribed(&self, id: SubscriberId) -> bool {
        let state = self.state.lock();
        !state.retired && state.entry.contains(id)
    }

    /// Deliver `message` to every current subscriber in subscription order.
    ///
    /// Subscribers removed while dispatch is running are skipped, subscribers
    /// added while it is running see the next message. A handler that fails
    /// or panics is reported and the remaining handlers still run.
    pub fn dispatch(&self, message: &M) -> DispatchOutcome {
        let _gate = self.gate.lock();
        let _scope = DispatchScope::enter(self.key);

        let subscribers = {
            let state = self.state.lock();
            if state.retired {
                return DispatchOutcome::default();
            }
            state.entry.snapshot()
        };

        let mut outcome = DispatchOutcome::default();
        for (id, handler) in subscribers {
            if !self.is_subscribed(id) {
                continue;
            }

            if self.invoke(id, || handler(message)) {
                outcome.delivered += 1;
            } else {
                outcome.failed += 1;
            }
        }

        metrics::record_messages_dispatched(outcome.delivered as u64);
        outcome
    }

    /// Run `deliver` on behalf of subscriber `id` alone.
    ///
    /// Serialized with [`dispatch`](Self::dispatch) through the same gate, so
    /// it never overlaps a dispatch on this topic and shutdown waits for it.
    /// Membership is checked while holding the gate; returns `None` without
    /// running `deliver` if `id` has left. Otherwise returns whether it
    /// succeeded. Failures and panics are counted like handler failures.
    pub fn deliver_to<F>(&self, id: SubscriberId, deliver: F) -> Option<bool>
    where
        F: FnOnce() -> Result<(), HandlerError>,
    {
        let _gate = self.gate.lock();
        let _scope = DispatchScope::enter(self.key);

        if !self.is_subscribed(id) {
            return None;
        }
        let delivered = self.invoke(id, deliver);
        if delivered {
            metrics::record_messages_dispatched(1);
        }
        Some(delivered)
    }

    /// Call one handler with panic isolation. Returns `true` on success.
    fn invoke<F>(&self, id: SubscriberId, call: F) -> bool
    where
        F: FnOnce() -> Result<(), HandlerError>,
    {
        match catch_unwind(AssertUnwindSafe(call)) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_handler_error(HandlerFailure::Error);
                tracing::warn!(
                    topic = %self.topic,
                    subscriber = %id,
                    error = %e,
                    "Subscriber handler failed"
                );
                false
            }
            Err(panic) => {
                self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_handler_error(HandlerFailure::Panic);
                tracing::error!(
                    topic = %self.topic,
                    subscriber = %id,
                    panic = %panic_message(panic.as_ref()),
                    "Subscriber handler panicked"
                );
                false
            }
        }
    }

    /// Count a received frame.
    pub fn record_frame(&self) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a frame that failed to decode.
    pub fn record_decode_error(&self) {
        self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a scheduled reconnect.
    pub fn record_reconnect(&self) {
        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot statistics for this topic.
    #[must_use]
    pub fn stats(&self) -> TopicStats {
        let (state, subscribers) = {
            let state = self.state.lock();
            (state.connection, state.entry.len())
        };
        TopicStats {
            topic: self.topic.clone(),
            state,
            subscribers,
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            handler_errors: self.counters.handler_errors.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Retire the slot and drop all subscribers. Returns how many were dropped.
    pub(crate) fn retire(&self) -> usize {
        let removed = {
            let mut state = self.state.lock();
            state.retired = true;
            if matches!(
                state.connection,
                ConnectionState::Open | ConnectionState::Connecting
            ) {
                state.connection = ConnectionState::Closing;
            }
            state.entry.clear()
        };
        self.cancel.cancel();
        removed
    }

    /// Block until any dispatch in progress on another thread has finished.
    ///
    /// Skipped when the current thread holds this slot's gate, i.e. when
    /// called from one of this slot's own handlers. Gates of other slots are
    /// still waited on; their handlers never wait on ours.
    pub(crate) fn wait_for_dispatch(&self) {
        if !holds_gate(self.key) {
            drop(self.gate.lock());
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

// =============================================================================
// Registration
// =============================================================================

/// Result of a successful registration.
pub enum Registration<M> {
    /// The topic had no slot; a new one was created and needs a connection.
    Created {
        /// ID of the new subscriber.
        id: SubscriberId,
        /// The new slot.
        slot: Arc<TopicSlot<M>>,
        /// Retired slot for the same topic whose connection is still draining.
        predecessor: Option<Arc<TopicSlot<M>>>,
    },
    /// The subscriber joined an existing slot.
    Joined {
        /// ID of the new subscriber.
        id: SubscriberId,
        /// The existing slot.
        slot: Arc<TopicSlot<M>>,
    },
}

impl<M> Registration<M> {
    /// ID of the registered subscriber.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        match self {
            Self::Created { id, .. } | Self::Joined { id, .. } => *id,
        }
    }

    /// Slot the subscriber was added to.
    #[must_use]
    pub const fn slot(&self) -> &Arc<TopicSlot<M>> {
        match self {
            Self::Created { slot, .. } | Self::Joined { slot, .. } => slot,
        }
    }
}

/// What the connection owner should do after a connection epoch ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Subscribers remain; reconnect through the backoff policy.
    Reconnect,
    /// The topic is retired; stop for good.
    Finalize,
}

// =============================================================================
// Subscription Registry
// =============================================================================

struct RegistryMap<M> {
    topics: HashMap<Topic, Arc<TopicSlot<M>>>,
    draining: HashMap<Topic, Arc<TopicSlot<M>>>,
    terminated: bool,
}

/// Thread-safe topic registry with reference-counted teardown.
///
/// # Example
///
/// ```rust
/// use market_stream_mux::application::services::registry::{
///     Registration, SubscriptionRegistry, handler,
/// };
/// use tokio_util::sync::CancellationToken;
///
/// let registry = SubscriptionRegistry::<String>::new(CancellationToken::new());
///
/// // First subscriber creates the topic slot
/// let first = registry.register("btcusdt@aggTrade".into(), handler(|_| Ok(()))).unwrap();
/// assert!(matches!(first, Registration::Created { .. }));
///
/// // Second subscriber joins it
/// let second = registry.register("btcusdt@aggTrade".into(), handler(|_| Ok(()))).unwrap();
/// assert!(matches!(second, Registration::Joined { .. }));
///
/// // Last one out retires the slot
/// let topic = "btcusdt@aggTrade".into();
/// assert!(registry.unregister(&topic, first.id()));
/// assert!(registry.unregister(&topic, second.id()));
/// assert_eq!(registry.topic_count(), 0);
/// ```
pub struct SubscriptionRegistry<M> {
    map: RwLock<RegistryMap<M>>,
    root: CancellationToken,
    next_id: AtomicU64,
    subscribers: AtomicUsize,
}

impl<M> SubscriptionRegistry<M> {
    /// Create an empty registry. Slot tokens are children of `root`.
    #[must_use]
    pub fn new(root: CancellationToken) -> Self {
        Self {
            map: RwLock::new(RegistryMap {
                topics: HashMap::new(),
                draining: HashMap::new(),
                terminated: false,
            }),
            root,
            next_id: AtomicU64::new(1),
            subscribers: AtomicUsize::new(0),
        }
    }

    /// Register a subscriber on `topic`.
    ///
    /// # Errors
    ///
    /// Returns `MultiplexerError::Closed` after shutdown.
    pub fn register(
        &self,
        topic: Topic,
        handler: Handler<M>,
    ) -> Result<Registration<M>, MultiplexerError> {
        let mut map = self.map.write();
        if map.terminated {
            return Err(MultiplexerError::Closed);
        }

        let id = SubscriberId::new(self.next_id.fetch_add(1, Ordering::Relaxed));

        if let Some(slot) = map.topics.get(&topic).cloned() {
            {
                let mut state = slot.state.lock();
                if !state.retired {
                    state.entry.push(id, handler);
                    drop(state);
                    self.subscriber_added();
                    tracing::debug!(topic = %topic, subscriber = %id, "Subscriber joined topic");
                    return Ok(Registration::Joined { id, slot });
                }
            }
            // Retired by a concurrent unregister that has not unlinked it yet.
            map.topics.remove(&topic);
            if !slot.done.is_cancelled() {
                map.draining.insert(topic.clone(), slot);
            }
        }

        let slot = Arc::new(TopicSlot::new(topic.clone(), self.root.child_token()));
        slot.state.lock().entry.push(id, handler);
        let predecessor = map.draining.get(&topic).cloned();
        map.topics.insert(topic.clone(), Arc::clone(&slot));
        metrics::set_active_topics(map.topics.len());
        drop(map);

        self.subscriber_added();
        tracing::info!(
            topic = %topic,
            subscriber = %id,
            draining = predecessor.is_some(),
            "Topic created"
        );

        Ok(Registration::Created {
            id,
            slot,
            predecessor,
        })
    }

    /// Remove exactly one subscriber.
    ///
    /// Removing the last subscriber retires the slot, which stops its
    /// connection and pending reconnects. Returns `false` if the subscriber
    /// was not registered, so a second call is a no-op.
    pub fn unregister(&self, topic: &Topic, id: SubscriberId) -> bool {
        let Some(slot) = self.map.read().topics.get(topic).cloned() else {
            return false;
        };

        let remaining = {
            let mut state = slot.state.lock();
            if state.retired {
                return false;
            }
            let Some(remaining) = state.entry.remove(id) else {
                return false;
            };
            if remaining == 0 {
                state.retired = true;
                if matches!(
                    state.connection,
                    ConnectionState::Open | ConnectionState::Connecting
                ) {
                    state.connection = ConnectionState::Closing;
                }
            }
            remaining
        };
        self.subscriber_removed(1);
        tracing::debug!(topic = %topic, subscriber = %id, remaining, "Subscriber left topic");

        if remaining == 0 {
            slot.cancel.cancel();

            let mut map = self.map.write();
            if map
                .topics
                .get(topic)
                .is_some_and(|current| Arc::ptr_eq(current, &slot))
            {
                map.topics.remove(topic);
                if !slot.done.is_cancelled() {
                    map.draining.insert(topic.clone(), slot);
                }
            }
            metrics::set_active_topics(map.topics.len());
            drop(map);

            tracing::info!(topic = %topic, "Last subscriber left, closing topic");
        }

        true
    }

    /// Check whether a subscriber is still registered on `topic`.
    #[must_use]
    pub fn is_subscribed(&self, topic: &Topic, id: SubscriberId) -> bool {
        self.slot(topic).is_some_and(|slot| slot.is_subscribed(id))
    }

    /// Run `deliver` for subscriber `id` of `topic`, serialized with dispatch.
    ///
    /// Returns `None` if the subscriber is no longer registered.
    pub fn deliver_to<F>(&self, topic: &Topic, id: SubscriberId, deliver: F) -> Option<bool>
    where
        F: FnOnce() -> Result<(), HandlerError>,
    {
        self.slot(topic)?.deliver_to(id, deliver)
    }

    /// Dispatch `message` to the subscribers of `topic`.
    pub fn dispatch(&self, topic: &Topic, message: &M) -> DispatchOutcome {
        self.slot(topic)
            .map_or_else(DispatchOutcome::default, |slot| slot.dispatch(message))
    }

    /// Decide what follows the end of a connection epoch on `slot`.
    #[must_use]
    pub fn on_connection_closed(&self, slot: &TopicSlot<M>) -> CloseDecision {
        if slot.cancel.is_cancelled() {
            return CloseDecision::Finalize;
        }
        let state = slot.state.lock();
        if state.retired || state.entry.is_empty() {
            CloseDecision::Finalize
        } else {
            CloseDecision::Reconnect
        }
    }

    /// Forget a slot whose connection task has exited.
    pub(crate) fn release(&self, slot: &Arc<TopicSlot<M>>) {
        let mut map = self.map.write();
        if map
            .draining
            .get(&slot.topic)
            .is_some_and(|draining| Arc::ptr_eq(draining, slot))
        {
            map.draining.remove(&slot.topic);
        }
    }

    /// Mark the registry terminated and take every slot, live or draining.
    ///
    /// Returns `None` if the registry was already terminated.
    pub(crate) fn terminate(&self) -> Option<Vec<Arc<TopicSlot<M>>>> {
        let mut map = self.map.write();
        if map.terminated {
            return None;
        }
        map.terminated = true;

        let mut slots: Vec<_> = map.topics.drain().map(|(_, slot)| slot).collect();
        slots.extend(map.draining.drain().map(|(_, slot)| slot));
        metrics::set_active_topics(0);
        Some(slots)
    }

    /// Account for subscribers dropped outside `unregister`.
    pub(crate) fn subscribers_dropped(&self, count: usize) {
        self.subscriber_removed(count);
    }

    /// Check if the registry has been terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.map.read().terminated
    }

    /// Number of topics with at least one subscriber.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.map.read().topics.len()
    }

    /// Connection state of `topic`, if it has subscribers.
    #[must_use]
    pub fn connection_state(&self, topic: &Topic) -> Option<ConnectionState> {
        self.slot(topic).map(|slot| slot.connection_state())
    }

    /// Snapshot statistics for every live topic.
    #[must_use]
    pub fn stats(&self) -> MultiplexerStats {
        let (terminated, slots): (bool, Vec<_>) = {
            let map = self.map.read();
            (map.terminated, map.topics.values().cloned().collect())
        };
        let mut topics: Vec<_> = slots.iter().map(|slot| slot.stats()).collect();
        topics.sort_by(|a, b| a.topic.cmp(&b.topic));
        MultiplexerStats { terminated, topics }
    }

    fn slot(&self, topic: &Topic) -> Option<Arc<TopicSlot<M>>> {
        self.map.read().topics.get(topic).cloned()
    }

    fn subscriber_added(&self) {
        let total = self.subscribers.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_active_subscribers(total);
    }

    fn subscriber_removed(&self, count: usize) {
        let previous = self
            .subscribers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(count))
            })
            .unwrap_or(0);
        metrics::set_active_subscribers(previous.saturating_sub(count));
    }
}

// =============================================================================
// Subscription Control
// =============================================================================

/// Type-erased view of a registry used by subscription handles.
pub(crate) trait SubscriptionControl: Send + Sync {
    fn unsubscribe(&self, topic: &Topic, id: SubscriberId) -> bool;
    fn is_subscribed(&self, topic: &Topic, id: SubscriberId) -> bool;
    fn deliver_to(
        &self,
        topic: &Topic,
        id: SubscriberId,
        deliver: &mut dyn FnMut() -> Result<(), HandlerError>,
    ) -> Option<bool>;
}

impl<M: 'static> SubscriptionControl for SubscriptionRegistry<M> {
    fn unsubscribe(&self, topic: &Topic, id: SubscriberId) -> bool {
        self.unregister(topic, id)
    }

    fn is_subscribed(&self, topic: &Topic, id: SubscriberId) -> bool {
        Self::is_subscribed(self, topic, id)
    }

    fn deliver_to(
        &self,
        topic: &Topic,
        id: SubscriberId,
        deliver: &mut dyn FnMut() -> Result<(), HandlerError>,
    ) -> Option<bool> {
        Self::deliver_to(self, topic, id, deliver)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;

    fn registry() -> SubscriptionRegistry<u32> {
        SubscriptionRegistry::new(CancellationToken::new())
    }

    fn noop() -> Handler<u32> {
        handler(|_| Ok(()))
    }

    fn recording(log: &Arc<Mutex<Vec<(&'static str, u32)>>>, name: &'static str) -> Handler<u32> {
        let log = Arc::clone(log);
        handler(move |m: &u32| {
            log.lock().push((name, *m));
            Ok(())
        })
    }

    #[test]
    fn register_new_topic_creates_slot() {
        let registry = registry();

        let registration = registry.register("a".into(), noop()).unwrap();

        assert!(matches!(
            registration,
            Registration::Created {
                predecessor: None,
                ..
            }
        ));
        assert_eq!(registry.topic_count(), 1);
        assert_eq!(registry.connection_state(&"a".into()), Some(ConnectionState::Idle));
    }

    #[test]
    fn register_existing_topic_joins_slot() {
        let registry = registry();

        let first = registry.register("a".into(), noop()).unwrap();
        let second = registry.register("a".into(), noop()).unwrap();

        assert!(matches!(second, Registration::Joined { .. }));
        assert!(Arc::ptr_eq(first.slot(), second.slot()));
        assert_ne!(first.id(), second.id());
        assert_eq!(first.slot().subscriber_count(), 2);
    }

    #[test]
    fn unregister_with_remaining_subscribers_keeps_slot() {
        let registry = registry();
        let topic: Topic = "a".into();

        let first = registry.register(topic.clone(), noop()).unwrap();
        let _second = registry.register(topic.clone(), noop()).unwrap();

        assert!(registry.unregister(&topic, first.id()));
        assert_eq!(registry.topic_count(), 1);
        assert!(!first.slot().is_retired());
        assert!(!first.slot().cancel_token().is_cancelled());
    }

    #[test]
    fn unregister_last_subscriber_retires_slot() {
        let registry = registry();
        let topic: Topic = "a".into();

        let only = registry.register(topic.clone(), noop()).unwrap();

        assert!(registry.unregister(&topic, only.id()));
        assert_eq!(registry.topic_count(), 0);
        assert!(only.slot().is_retired());
        assert!(only.slot().cancel_token().is_cancelled());
        assert_eq!(registry.connection_state(&topic), None);
    }

    #[test]
    fn unregister_twice_is_noop() {
        let registry = registry();
        let topic: Topic = "a".into();

        let first = registry.register(topic.clone(), noop()).unwrap();
        let _second = registry.register(topic.clone(), noop()).unwrap();

        assert!(registry.unregister(&topic, first.id()));
        assert!(!registry.unregister(&topic, first.id()));
        assert_eq!(registry.topic_count(), 1);
    }

    #[test]
    fn resubscribe_after_teardown_creates_new_slot_with_predecessor() {
        let registry = registry();
        let topic: Topic = "a".into();

        let old = registry.register(topic.clone(), noop()).unwrap();
        registry.unregister(&topic, old.id());

        let new = registry.register(topic.clone(), noop()).unwrap();

        let Registration::Created {
            slot, predecessor, ..
        } = new
        else {
            panic!("expected a new slot");
        };
        assert!(!Arc::ptr_eq(&slot, old.slot()));
        assert!(Arc::ptr_eq(predecessor.as_ref().unwrap(), old.slot()));
    }

    #[test]
    fn released_predecessor_is_forgotten() {
        let registry = registry();
        let topic: Topic = "a".into();

        let old = registry.register(topic.clone(), noop()).unwrap();
        registry.unregister(&topic, old.id());
        old.slot().done_token().cancel();
        registry.release(old.slot());

        let new = registry.register(topic, noop()).unwrap();

        assert!(matches!(
            new,
            Registration::Created {
                predecessor: None,
                ..
            }
        ));
    }

    #[test]
    fn dispatch_in_subscription_order() {
        let registry = registry();
        let topic: Topic = "a".into();
        let log = Arc::new(Mutex::new(Vec::new()));

        let _a = registry.register(topic.clone(), recording(&log, "a")).unwrap();
        let _b = registry.register(topic.clone(), recording(&log, "b")).unwrap();
        let _c = registry.register(topic.clone(), recording(&log, "c")).unwrap();

        let outcome = registry.dispatch(&topic, &7);

        assert_eq!(outcome.delivered, 3);
        assert_eq!(*log.lock(), vec![("a", 7), ("b", 7), ("c", 7)]);
    }

    #[test]
    fn failing_handler_does_not_stop_others() {
        let registry = registry();
        let topic: Topic = "a".into();
        let log = Arc::new(Mutex::new(Vec::new()));

        let _a = registry.register(topic.clone(), recording(&log, "a")).unwrap();
        let failing = registry
            .register(topic.clone(), handler(|_| Err(HandlerError::new("boom"))))
            .unwrap();
        let _panicking = registry
            .register(topic.clone(), handler(|_| panic!("handler panic")))
            .unwrap();
        let _c = registry.register(topic.clone(), recording(&log, "c")).unwrap();

        let outcome = registry.dispatch(&topic, &1);

        assert_eq!(outcome, DispatchOutcome { delivered: 2, failed: 2 });
        assert_eq!(*log.lock(), vec![("a", 1), ("c", 1)]);
        assert_eq!(failing.slot().stats().handler_errors, 2);
    }

    #[test]
    fn handler_removed_during_dispatch_is_skipped() {
        let registry = Arc::new(registry());
        let topic: Topic = "a".into();
        let log = Arc::new(Mutex::new(Vec::new()));
        let victim = Arc::new(Mutex::new(None::<SubscriberId>));

        let remover = {
            let registry = Arc::clone(&registry);
            let victim = Arc::clone(&victim);
            let topic = topic.clone();
            handler(move |_: &u32| {
                if let Some(id) = *victim.lock() {
                    registry.unregister(&topic, id);
                }
                Ok(())
            })
        };

        let _first = registry.register(topic.clone(), remover).unwrap();
        let second = registry.register(topic.clone(), recording(&log, "b")).unwrap();
        *victim.lock() = Some(second.id());

        registry.dispatch(&topic, &1);

        assert!(log.lock().is_empty());
        assert!(!registry.is_subscribed(&topic, second.id()));
    }

    #[test]
    fn retired_slot_never_dispatches() {
        let registry = registry();
        let topic: Topic = "a".into();
        let log = Arc::new(Mutex::new(Vec::new()));

        let only = registry.register(topic.clone(), recording(&log, "a")).unwrap();
        let slot = Arc::clone(only.slot());
        registry.unregister(&topic, only.id());

        let outcome = slot.dispatch(&1);

        assert_eq!(outcome, DispatchOutcome::default());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn connection_closed_decision() {
        let registry = registry();
        let topic: Topic = "a".into();

        let only = registry.register(topic.clone(), noop()).unwrap();
        let slot = Arc::clone(only.slot());
        assert_eq!(registry.on_connection_closed(&slot), CloseDecision::Reconnect);

        registry.unregister(&topic, only.id());
        assert_eq!(registry.on_connection_closed(&slot), CloseDecision::Finalize);
    }

    #[test]
    fn terminate_takes_all_slots_and_rejects_register() {
        let registry = registry();

        let live = registry.register("a".into(), noop()).unwrap();
        let draining = registry.register("b".into(), noop()).unwrap();
        registry.unregister(&"b".into(), draining.id());

        let slots = registry.terminate().unwrap();

        assert_eq!(slots.len(), 2);
        assert!(slots.iter().any(|s| Arc::ptr_eq(s, live.slot())));
        assert!(registry.is_terminated());
        assert!(registry.terminate().is_none());
        assert!(matches!(
            registry.register("a".into(), noop()),
            Err(MultiplexerError::Closed)
        ));
    }

    #[test]
    fn slot_tokens_follow_root() {
        let root = CancellationToken::new();
        let registry = SubscriptionRegistry::<u32>::new(root.clone());

        let only = registry.register("a".into(), noop()).unwrap();
        root.cancel();

        assert!(only.slot().cancel_token().is_cancelled());
        assert_eq!(
            registry.on_connection_closed(only.slot()),
            CloseDecision::Finalize
        );
    }

    #[test]
    fn stats_sorted_by_topic() {
        let registry = registry();

        let _b = registry.register("b".into(), noop()).unwrap();
        let _a1 = registry.register("a".into(), noop()).unwrap();
        let _a2 = registry.register("a".into(), noop()).unwrap();

        let stats = registry.stats();

        assert_eq!(stats.topics.len(), 2);
        assert_eq!(stats.topics[0].topic.as_str(), "a");
        assert_eq!(stats.topics[0].subscribers, 2);
        assert_eq!(stats.total_subscribers(), 3);
    }

    #[test]
    fn concurrent_subscribe_unsubscribe() {
        use std::thread;

        let registry = Arc::new(registry());
        let mut handles = vec![];

        for t in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let topic: Topic = format!("topic-{}", t % 2).into();
                for _ in 0..200 {
                    let registration = registry.register(topic.clone(), noop()).unwrap();
                    registry.dispatch(&topic, &1);
                    assert!(registry.unregister(&topic, registration.id()));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.topic_count(), 0);
        assert_eq!(registry.stats().total_subscribers(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Subscribe(u8),
        Unsubscribe(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..3).prop_map(Op::Subscribe),
            (0usize..16).prop_map(Op::Unsubscribe),
        ]
    }

    #[test]
    fn deliver_to_reaches_only_that_subscriber() {
        let registry = registry();
        let topic: Topic = "a".into();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = registry.register(topic.clone(), recording(&log, "a")).unwrap();
        let _second = registry.register(topic.clone(), recording(&log, "b")).unwrap();

        let sink = Arc::clone(&log);
        let delivered = registry.deliver_to(&topic, first.id(), || {
            sink.lock().push(("direct", 7));
            Ok(())
        });

        assert_eq!(delivered, Some(true));
        assert_eq!(*log.lock(), vec![("direct", 7)]);
    }

    #[test]
    fn deliver_to_skips_departed_subscriber() {
        let registry = registry();
        let topic: Topic = "a".into();
        let first = registry.register(topic.clone(), noop()).unwrap();
        let _second = registry.register(topic.clone(), noop()).unwrap();
        registry.unregister(&topic, first.id());

        let ran = AtomicBool::new(false);
        let delivered = registry.deliver_to(&topic, first.id(), || {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(delivered, None);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn deliver_to_counts_failures_and_panics() {
        let registry = registry();
        let topic: Topic = "a".into();
        let only = registry.register(topic.clone(), noop()).unwrap();

        let failed = registry.deliver_to(&topic, only.id(), || Err(HandlerError::new("boom")));
        let panicked = registry.deliver_to(&topic, only.id(), || panic!("boom"));

        assert_eq!(failed, Some(false));
        assert_eq!(panicked, Some(false));
        assert_eq!(only.slot().stats().handler_errors, 2);
    }

    #[test]
    fn deliver_to_never_overlaps_dispatch() {
        let registry = registry();
        let topic: Topic = "a".into();
        let busy = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let slow = {
            let (busy, entered, overlaps) =
                (Arc::clone(&busy), Arc::clone(&entered), Arc::clone(&overlaps));
            handler(move |_: &u32| {
                if busy.swap(true, Ordering::SeqCst) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                entered.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                busy.store(false, Ordering::SeqCst);
                Ok(())
            })
        };
        let registration = registry.register(topic.clone(), slow).unwrap();

        let slot = Arc::clone(registration.slot());
        let dispatcher = std::thread::spawn(move || slot.dispatch(&1));
        while !entered.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }

        let delivered = registry.deliver_to(&topic, registration.id(), || {
            if busy.swap(true, Ordering::SeqCst) {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            busy.store(false, Ordering::SeqCst);
            Ok(())
        });
        dispatcher.join().unwrap();

        assert_eq!(delivered, Some(true));
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    proptest! {
        #[test]
        fn slot_exists_iff_topic_has_subscribers(ops in proptest::collection::vec(op(), 1..64)) {
            let registry = registry();
            let mut live: Vec<(Topic, SubscriberId)> = Vec::new();

            for op in ops {
                match op {
                    Op::Subscribe(t) => {
                        let topic: Topic = format!("t{t}").into();
                        let registration = registry.register(topic.clone(), noop()).unwrap();
                        live.push((topic, registration.id()));
                    }
                    Op::Unsubscribe(i) => {
                        if !live.is_empty() {
                            let (topic, id) = live.remove(i % live.len());
                            prop_assert!(registry.unregister(&topic, id));
                            prop_assert!(!registry.unregister(&topic, id));
                        }
                    }
                }

                let mut expected: HashMap<&str, usize> = HashMap::new();
                for (topic, _) in &live {
                    *expected.entry(topic.as_str()).or_default() += 1;
                }
                let stats = registry.stats();
                prop_assert_eq!(stats.topics.len(), expected.len());
                for topic in &stats.topics {
                    prop_assert_eq!(Some(&topic.subscribers), expected.get(topic.topic.as_str()));
                }
            }
        }
    }
}
