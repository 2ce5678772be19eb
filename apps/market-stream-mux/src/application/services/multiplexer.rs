//! Streaming Subscription Multiplexer
//!
//! Public entry point of the core. Maps many logical subscriptions onto one
//! physical connection per topic and owns the reconnect policy.
//!
//! # Lifecycle per topic
//!
//! ```text
//! subscribe (first) ──► slot created ──► supervisor task spawned
//!                                             │
//!                     ┌───────────────────────┤
//!                     ▼                       │
//!               connection epoch ──► ends ──► subscribers left?
//!                     ▲                       │ yes        │ no
//!                     └──── backoff sleep ◄───┘            ▼
//!                                                    supervisor exits
//! unsubscribe (last) ──► slot retired ──► epoch or backoff cancelled
//! ```
//!
//! `subscribe` returns immediately; connecting happens on the supervisor
//! task. A slot created while the previous slot for the same topic is still
//! closing waits for it, so a topic never has two live connections.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;

use super::connection::{ConnectionSettings, EpochEnd, TopicConnection};
use super::lifecycle::{LifecycleController, ShutdownSummary};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::registry::{
    CloseDecision, Registration, SubscriptionControl, SubscriptionRegistry, TopicSlot, handler,
};
use crate::application::ports::{FrameDecoder, StatsSource, StreamTransport};
use crate::domain::subscription::{ConnectionState, HandlerError, MultiplexerStats, SubscriberId};
use crate::domain::topic::Topic;
use crate::infrastructure::metrics;

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by the multiplexer API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MultiplexerError {
    /// The multiplexer has been shut down.
    #[error("multiplexer is closed")]
    Closed,
}

// =============================================================================
// Configuration
// =============================================================================

/// Multiplexer configuration.
#[derive(Debug, Clone, Default)]
pub struct MultiplexerConfig {
    /// Backoff between connection epochs.
    pub reconnect: ReconnectConfig,
    /// Per-epoch timeouts.
    pub connection: ConnectionSettings,
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Capability to remove exactly one subscription.
///
/// Dropping the handle does not unsubscribe.
#[must_use = "the subscription stays active until dispose() is called"]
pub struct SubscriptionHandle {
    control: Weak<dyn SubscriptionControl>,
    topic: Topic,
    id: SubscriberId,
    disposed: AtomicBool,
}

impl SubscriptionHandle {
    /// Topic this subscription is on.
    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Subscriber ID of this registration.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Remove the subscription.
    ///
    /// Idempotent. Returns `true` only for the call that removed it.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.control
            .upgrade()
            .is_some_and(|control| control.unsubscribe(&self.topic, self.id))
    }

    /// Check whether the subscription is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    /// Detached view of this subscription for liveness checks and out-of-band delivery.
    #[must_use]
    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus {
            control: Weak::clone(&self.control),
            topic: self.topic.clone(),
            id: self.id,
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("disposed", &self.disposed.load(Ordering::Acquire))
            .finish()
    }
}

/// Detached view of a subscription; cannot unsubscribe.
///
/// Besides probing liveness it can hand the subscriber a message produced
/// outside the topic's stream, such as a REST snapshot.
#[derive(Clone)]
pub struct SubscriptionStatus {
    control: Weak<dyn SubscriptionControl>,
    topic: Topic,
    id: SubscriberId,
}

impl SubscriptionStatus {
    /// Check whether the subscription is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.control
            .upgrade()
            .is_some_and(|control| control.is_subscribed(&self.topic, self.id))
    }

    /// Run `deliver` for this subscriber, serialized with its topic's dispatch.
    ///
    /// Liveness is checked under the topic's dispatch gate, so a subscription
    /// disposed or shut down before delivery starts never sees the message,
    /// and `shutdown()` does not return while a delivery is running.
    ///
    /// Returns `None` if the subscription is gone, otherwise whether
    /// `deliver` succeeded. Errors and panics are logged and counted as
    /// handler errors.
    pub fn deliver<F>(&self, deliver: F) -> Option<bool>
    where
        F: FnOnce() -> Result<(), HandlerError>,
    {
        let control = self.control.upgrade()?;
        let mut deliver = Some(deliver);
        control.deliver_to(&self.topic, self.id, &mut || {
            deliver.take().map_or(Ok(()), |deliver| deliver())
        })
    }
}

impl fmt::Debug for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionStatus")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

// =============================================================================
// Multiplexer
// =============================================================================

struct MultiplexerInner<D: FrameDecoder> {
    registry: Arc<SubscriptionRegistry<D::Message>>,
    lifecycle: LifecycleController,
    transport: Arc<dyn StreamTransport>,
    decoder: D,
    config: MultiplexerConfig,
}

/// Streaming subscription multiplexer. Cheap to clone; clones share state.
pub struct Multiplexer<D: FrameDecoder> {
    inner: Arc<MultiplexerInner<D>>,
}

impl<D: FrameDecoder> Clone for Multiplexer<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: FrameDecoder> Multiplexer<D> {
    /// Create a multiplexer that runs its connections on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(transport: Arc<dyn StreamTransport>, decoder: D, config: MultiplexerConfig) -> Self {
        Self::with_runtime(Handle::current(), transport, decoder, config)
    }

    /// Create a multiplexer that runs its connections on `runtime`.
    #[must_use]
    pub fn with_runtime(
        runtime: Handle,
        transport: Arc<dyn StreamTransport>,
        decoder: D,
        config: MultiplexerConfig,
    ) -> Self {
        let lifecycle = LifecycleController::new(runtime);
        let registry = Arc::new(SubscriptionRegistry::new(lifecycle.root_token().clone()));
        Self {
            inner: Arc::new(MultiplexerInner {
                registry,
                lifecycle,
                transport,
                decoder,
                config,
            }),
        }
    }

    /// Subscribe `handler` to `topic`.
    ///
    /// The first subscriber of a topic starts its connection in the
    /// background; later subscribers share it. Handlers for one topic run in
    /// subscription order on that topic's connection task.
    ///
    /// # Errors
    ///
    /// Returns `MultiplexerError::Closed` after shutdown.
    pub fn subscribe<F>(
        &self,
        topic: impl Into<Topic>,
        on_message: F,
    ) -> Result<SubscriptionHandle, MultiplexerError>
    where
        F: Fn(&D::Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let topic = topic.into();
        let registration = self
            .inner
            .registry
            .register(topic.clone(), handler(on_message))?;
        let id = registration.id();

        if let Registration::Created {
            slot, predecessor, ..
        } = registration
        {
            self.spawn_supervisor(slot, predecessor);
        }

        let registry: Arc<dyn SubscriptionControl> = self.inner.registry.clone();
        Ok(SubscriptionHandle {
            control: Arc::downgrade(&registry),
            topic,
            id,
            disposed: AtomicBool::new(false),
        })
    }

    /// Remove the subscription behind `handle`. Same as `handle.dispose()`.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        handle.dispose()
    }

    /// Shut down: close every connection, cancel every pending reconnect,
    /// clear the registry and reject later subscribes.
    pub fn shutdown(&self) -> ShutdownSummary {
        self.inner.lifecycle.shutdown(&self.inner.registry)
    }

    /// Wait until shutdown has run and every connection task has exited.
    pub async fn closed(&self) {
        self.inner.lifecycle.closed().await;
    }

    /// Check if the multiplexer has been shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.registry.is_terminated()
    }

    /// Connection state of `topic`, if it has subscribers.
    #[must_use]
    pub fn connection_state(&self, topic: &str) -> Option<ConnectionState> {
        self.inner.registry.connection_state(&Topic::from(topic))
    }

    /// Snapshot statistics.
    #[must_use]
    pub fn stats(&self) -> MultiplexerStats {
        self.inner.registry.stats()
    }

    /// Run `future` as a tracked background task dropped at shutdown.
    pub fn spawn_background<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.lifecycle.spawn_cancellable(future);
    }

    fn spawn_supervisor(
        &self,
        slot: Arc<TopicSlot<D::Message>>,
        predecessor: Option<Arc<TopicSlot<D::Message>>>,
    ) {
        let inner = Arc::clone(&self.inner);
        // Fires even if the task is dropped before it first runs.
        let done = slot.done_token().clone().drop_guard();
        self.inner.lifecycle.spawn(async move {
            supervise(&inner, &slot, predecessor).await;
            drop(done);
            inner.registry.release(&slot);
        });
    }
}

impl<D: FrameDecoder> StatsSource for Multiplexer<D> {
    fn stats(&self) -> MultiplexerStats {
        Self::stats(self)
    }
}

impl<D: FrameDecoder> fmt::Debug for Multiplexer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("topics", &self.inner.registry.topic_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Topic Supervisor
// =============================================================================

/// Own the connection for one slot until the slot is retired.
async fn supervise<D: FrameDecoder>(
    inner: &MultiplexerInner<D>,
    slot: &TopicSlot<D::Message>,
    predecessor: Option<Arc<TopicSlot<D::Message>>>,
) {
    let topic = slot.topic();

    if let Some(previous) = predecessor {
        tracing::debug!(topic = %topic, "Waiting for previous connection to close");
        previous.done_token().cancelled().await;
    }

    let mut policy = ReconnectPolicy::new(inner.config.reconnect.clone());

    loop {
        let report = TopicConnection::new(
            slot,
            inner.transport.as_ref(),
            &inner.decoder,
            &inner.config.connection,
        )
        .run()
        .await;

        if report.end == EpochEnd::Cancelled {
            break;
        }
        if report.frames > 0 {
            policy.reset();
        }
        if inner.registry.on_connection_closed(slot) == CloseDecision::Finalize {
            break;
        }

        let delay = policy.next_delay();
        slot.record_reconnect();
        metrics::record_reconnect(topic);
        tracing::info!(
            topic = %topic,
            attempt = policy.attempt_count(),
            delay_ms = delay.as_millis(),
            "Reconnecting topic stream"
        );

        tokio::select! {
            biased;
            () = slot.cancel_token().cancelled() => {
                tracing::debug!(topic = %topic, "Reconnect abandoned");
                break;
            }
            () = tokio::time::sleep(delay) => {}
        }
    }

    slot.set_connection_state(ConnectionState::Closed);
    tracing::debug!(topic = %topic, "Topic supervisor exited");
}
