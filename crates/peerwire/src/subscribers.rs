//! Ordered multi-subscriber broadcast.

use crate::metrics::counters;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Identifier returned by `subscribe`, used to unsubscribe.
pub type SubscriptionId = u64;

/// A subscriber callback. Returning an error reports a callback failure.
pub type Callback<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

/// What a registry does when a callback fails or panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log the failure and keep delivering to the remaining subscribers.
    Isolate,
    /// Stop the broadcast and return the failure to the dispatcher.
    Propagate,
}

/// Subscribers for one event class, invoked in subscription order.
pub struct Subscribers<E> {
    entries: RwLock<Vec<(SubscriptionId, Callback<E>)>>,
    ids: Arc<AtomicU64>,
    policy: FailurePolicy,
}

impl<E> Subscribers<E> {
    /// Creates an empty registry with its own id sequence.
    #[must_use]
    pub fn new(policy: FailurePolicy) -> Self {
        Self::with_id_source(policy, Arc::new(AtomicU64::new(0)))
    }

    /// Creates an empty registry drawing ids from a shared sequence, so ids
    /// stay unique across several registries.
    #[must_use]
    pub fn with_id_source(policy: FailurePolicy, ids: Arc<AtomicU64>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            ids,
            policy,
        }
    }

    /// Adds a callback and returns its id.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push((id, Arc::new(callback)));
        id
    }

    /// Removes a callback. Returns `false` if the id is not registered here.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        match entries.iter().position(|(sid, _)| *sid == id) {
            Some(idx) => {
                entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` if no callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Delivers `event` to a snapshot of the current subscribers.
    ///
    /// Subscriptions added or removed by a callback take effect on the next
    /// dispatch. No lock is held while callbacks run.
    ///
    /// # Errors
    ///
    /// Only a [`FailurePolicy::Propagate`] registry returns an error: the
    /// first callback failure, after which remaining subscribers are skipped.
    pub fn dispatch(&self, event: &E) -> anyhow::Result<()> {
        let snapshot: Vec<Callback<E>> = self
            .entries
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in snapshot {
            let outcome = match self.policy {
                FailurePolicy::Propagate => callback(event),
                FailurePolicy::Isolate => catch_unwind(AssertUnwindSafe(|| callback(event)))
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("subscriber panicked"))),
            };
            if let Err(e) = outcome {
                counters::callback_failures_total();
                match self.policy {
                    FailurePolicy::Isolate => warn!(error = %e, "subscriber callback failed"),
                    FailurePolicy::Propagate => return Err(e),
                }
            }
        }
        Ok(())
    }
}

impl<E: Clone + Send + 'static> Subscribers<E> {
    /// Subscribes a bounded channel; a single task can consume events from
    /// the returned receiver. Events are dropped while the channel is full,
    /// and the subscription fails once the receiver is gone.
    pub fn subscribe_channel(&self, capacity: usize) -> (SubscriptionId, mpsc::Receiver<E>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.subscribe(move |event: &E| match tx.try_send(event.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(anyhow::anyhow!("subscriber channel full, event dropped"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(anyhow::anyhow!("subscriber channel closed"))
            }
        });
        (id, rx)
    }
}

impl<E> std::fmt::Debug for Subscribers<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("len", &self.len())
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn subscribers_run_in_subscription_order() {
        let subs = Subscribers::<u32>::new(FailurePolicy::Isolate);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in 0..3 {
            let seen = Arc::clone(&seen);
            subs.subscribe(move |v: &u32| {
                seen.lock().push((tag, *v));
                Ok(())
            });
        }

        subs.dispatch(&7).unwrap();
        assert_eq!(*seen.lock(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn isolated_failure_still_reaches_next_subscriber() {
        let subs = Subscribers::<()>::new(FailurePolicy::Isolate);
        let calls = Arc::new(AtomicUsize::new(0));

        subs.subscribe(|_| Err(anyhow::anyhow!("boom")));
        let c = Arc::clone(&calls);
        subs.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(subs.dispatch(&()).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn isolated_panic_does_not_escape_dispatch() {
        let subs = Subscribers::<()>::new(FailurePolicy::Isolate);
        let calls = Arc::new(AtomicUsize::new(0));

        subs.subscribe(|_| panic!("subscriber bug"));
        let c = Arc::clone(&calls);
        subs.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(subs.dispatch(&()).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn propagating_failure_stops_dispatch() {
        let subs = Subscribers::<()>::new(FailurePolicy::Propagate);
        let calls = Arc::new(AtomicUsize::new(0));

        subs.subscribe(|_| Err(anyhow::anyhow!("boom")));
        let c = Arc::clone(&calls);
        subs.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let err = subs.dispatch(&()).unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_removes_only_the_given_id() {
        let subs = Subscribers::<()>::new(FailurePolicy::Isolate);
        let a = subs.subscribe(|_| Ok(()));
        let b = subs.subscribe(|_| Ok(()));
        assert_ne!(a, b);

        assert!(subs.unsubscribe(a));
        assert!(!subs.unsubscribe(a));
        assert_eq!(subs.len(), 1);
        assert!(subs.unsubscribe(b));
        assert!(subs.is_empty());
    }

    #[test]
    fn subscribing_during_dispatch_affects_only_next_dispatch() {
        let subs = Arc::new(Subscribers::<()>::new(FailurePolicy::Isolate));
        let late_calls = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&subs);
        let late = Arc::clone(&late_calls);
        subs.subscribe(move |_| {
            let late = Arc::clone(&late);
            inner.subscribe(move |_| {
                late.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });

        subs.dispatch(&()).unwrap();
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        assert_eq!(subs.len(), 2);

        subs.dispatch(&()).unwrap();
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribing_self_during_dispatch_is_safe() {
        let subs = Arc::new(Subscribers::<()>::new(FailurePolicy::Isolate));
        let id_cell = Arc::new(AtomicU64::new(u64::MAX));

        let inner = Arc::clone(&subs);
        let cell = Arc::clone(&id_cell);
        let id = subs.subscribe(move |_| {
            inner.unsubscribe(cell.load(Ordering::SeqCst));
            Ok(())
        });
        id_cell.store(id, Ordering::SeqCst);

        subs.dispatch(&()).unwrap();
        assert!(subs.is_empty());
    }

    #[test]
    fn shared_id_source_keeps_ids_unique() {
        let ids = Arc::new(AtomicU64::new(0));
        let a = Subscribers::<()>::with_id_source(FailurePolicy::Isolate, Arc::clone(&ids));
        let b = Subscribers::<()>::with_id_source(FailurePolicy::Isolate, ids);

        let first = a.subscribe(|_| Ok(()));
        let second = b.subscribe(|_| Ok(()));
        assert_ne!(first, second);
        assert!(!a.unsubscribe(second));
    }

    #[tokio::test]
    async fn channel_subscription_delivers_events() {
        let subs = Subscribers::<u32>::new(FailurePolicy::Isolate);
        let (_, mut rx) = subs.subscribe_channel(4);

        subs.dispatch(&1).unwrap();
        subs.dispatch(&2).unwrap();

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }
}
