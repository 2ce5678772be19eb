//! Lifecycle Controller
//!
//! Owns the process-wide pieces of the multiplexer lifecycle: the root
//! cancellation token every topic token descends from, and the task tracker
//! every connection supervisor runs under.
//!
//! `shutdown()` is synchronous. When it returns the registry is terminated,
//! every slot is retired, every connection and backoff timer has been told
//! to stop, and no handler is running or will run again. Physical sockets
//! finish closing in the background; `closed()` waits for that.

use std::future::Future;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::registry::SubscriptionRegistry;

/// What a shutdown call tore down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Topics retired, including ones that were still draining.
    pub topics: usize,
    /// Subscribers dropped.
    pub subscribers: usize,
}

/// Process-wide disposal for a multiplexer.
#[derive(Debug)]
pub struct LifecycleController {
    root: CancellationToken,
    tracker: TaskTracker,
    runtime: Handle,
}

impl LifecycleController {
    /// Create a controller that spawns onto `runtime`.
    #[must_use]
    pub fn new(runtime: Handle) -> Self {
        Self {
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
            runtime,
        }
    }

    /// Root token; cancelled by shutdown.
    #[must_use]
    pub const fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    /// Check if shutdown has started.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Spawn a tracked task.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn_on(future, &self.runtime);
    }

    /// Spawn a tracked task that is dropped at shutdown.
    pub fn spawn_cancellable<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let root = self.root.clone();
        self.spawn(async move {
            tokio::select! {
                biased;
                () = root.cancelled() => {}
                () = future => {}
            }
        });
    }

    /// Terminate `registry` and stop everything it owns.
    ///
    /// Safe to call concurrently with subscribe and unsubscribe, from inside
    /// a handler, and more than once; calls after the first return an empty
    /// summary. From inside a handler, every topic's in-flight dispatch is
    /// waited out except the calling handler's own.
    pub fn shutdown<M>(&self, registry: &SubscriptionRegistry<M>) -> ShutdownSummary {
        let Some(slots) = registry.terminate() else {
            return ShutdownSummary::default();
        };

        self.root.cancel();

        let mut summary = ShutdownSummary {
            topics: slots.len(),
            subscribers: 0,
        };
        for slot in &slots {
            summary.subscribers += slot.retire();
        }
        registry.subscribers_dropped(summary.subscribers);

        for slot in &slots {
            slot.wait_for_dispatch();
        }

        self.tracker.close();

        tracing::info!(
            topics = summary.topics,
            subscribers = summary.subscribers,
            "Multiplexer shut down"
        );
        summary
    }

    /// Wait until shutdown has run and every tracked task has exited.
    pub async fn closed(&self) {
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::application::services::registry::handler;
    use crate::domain::topic::Topic;

    #[tokio::test]
    async fn shutdown_retires_everything_once() {
        let lifecycle = LifecycleController::new(Handle::current());
        let registry = SubscriptionRegistry::<u32>::new(lifecycle.root_token().clone());

        let a = registry.register("a".into(), handler(|_| Ok(()))).unwrap();
        let _a2 = registry.register("a".into(), handler(|_| Ok(()))).unwrap();
        let _b = registry.register("b".into(), handler(|_| Ok(()))).unwrap();

        let summary = lifecycle.shutdown(&registry);

        assert_eq!(
            summary,
            ShutdownSummary {
                topics: 2,
                subscribers: 3
            }
        );
        assert!(lifecycle.is_shut_down());
        assert!(a.slot().is_retired());
        assert!(a.slot().cancel_token().is_cancelled());
        assert_eq!(registry.stats().total_subscribers(), 0);
        assert_eq!(lifecycle.shutdown(&registry), ShutdownSummary::default());
    }

    #[tokio::test]
    async fn closed_waits_for_tracked_tasks() {
        let lifecycle = Arc::new(LifecycleController::new(Handle::current()));
        let registry = SubscriptionRegistry::<u32>::new(lifecycle.root_token().clone());
        let token = lifecycle.root_token().clone();

        lifecycle.spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        });
        lifecycle.spawn_cancellable(std::future::pending());

        lifecycle.shutdown(&registry);

        tokio::time::timeout(Duration::from_secs(1), lifecycle.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn closed_is_pending_until_shutdown() {
        let lifecycle = LifecycleController::new(Handle::current());
        let registry = SubscriptionRegistry::<u32>::new(lifecycle.root_token().clone());

        let mut closed = tokio_test::task::spawn(lifecycle.closed());
        tokio_test::assert_pending!(closed.poll());

        lifecycle.shutdown(&registry);

        tokio_test::assert_ready!(closed.poll());
    }

    #[tokio::test]
    async fn shutdown_from_handler_waits_for_other_topics() {
        let lifecycle = Arc::new(LifecycleController::new(Handle::current()));
        let registry = Arc::new(SubscriptionRegistry::<u32>::new(
            lifecycle.root_token().clone(),
        ));
        let slow_entered = Arc::new(AtomicBool::new(false));
        let slow_done = Arc::new(AtomicBool::new(false));
        let done_at_return = Arc::new(AtomicBool::new(false));

        let slow = {
            let (entered, done) = (Arc::clone(&slow_entered), Arc::clone(&slow_done));
            handler(move |_: &u32| {
                entered.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(150));
                done.store(true, Ordering::SeqCst);
                Ok(())
            })
        };
        let stopper = {
            let (lifecycle, registry) = (Arc::clone(&lifecycle), Arc::clone(&registry));
            let (done, seen) = (Arc::clone(&slow_done), Arc::clone(&done_at_return));
            handler(move |_: &u32| {
                lifecycle.shutdown(&registry);
                seen.store(done.load(Ordering::SeqCst), Ordering::SeqCst);
                Ok(())
            })
        };
        let y = registry.register("y".into(), slow).unwrap();
        let x = registry.register("x".into(), stopper).unwrap();

        let y_slot = Arc::clone(y.slot());
        let other = std::thread::spawn(move || y_slot.dispatch(&1));
        while !slow_entered.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }

        x.slot().dispatch(&1);
        other.join().unwrap();

        assert!(lifecycle.is_shut_down());
        assert!(done_at_return.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_blocks_later_registration() {
        let lifecycle = LifecycleController::new(Handle::current());
        let registry = SubscriptionRegistry::<u32>::new(lifecycle.root_token().clone());

        lifecycle.shutdown(&registry);

        let topic: Topic = "a".into();
        assert!(registry.register(topic, handler(|_| Ok(()))).is_err());
    }
}
