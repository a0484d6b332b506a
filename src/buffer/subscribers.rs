//! Broadcast fan-out to registered consumers after each callback.
//!
//! Handlers run on the handoff worker thread, in subscription order, with
//! a self-unsubscribe closure. A broadcast that arrives while one is in
//! progress is dropped; subscribers pick up the latest buffer state on the
//! next one.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

pub type SubscriberId = u64;

/// Ticket returned by subscribe; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    id: SubscriberId,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

struct Entry<E: ?Sized> {
    id: SubscriberId,
    handler: Arc<dyn Fn(&E, SubscriberId, &dyn Fn()) + Send + Sync>,
}

impl<E: ?Sized> Clone for Entry<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: Arc::clone(&self.handler),
        }
    }
}

/// Ordered list of subscribers with a re-entrancy-guarded broadcast.
///
/// The list is appended by `subscribe`, shrunk by `unsubscribe`, and
/// iterated over a snapshot during `broadcast` so a handler may
/// unsubscribe itself (or anyone else) without perturbing the iteration
/// in flight.
pub struct SubscriberList<E: ?Sized> {
    entries: Mutex<Vec<Entry<E>>>,
    broadcasting: AtomicBool,
    next_id: AtomicU64,
}

impl<E: ?Sized> SubscriberList<E> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(8)),
            broadcasting: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register `handler`, to be invoked on every subsequent broadcast
    /// with the event, its own id, and an unsubscribe closure.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E, SubscriberId, &dyn Fn()) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().push(Entry {
            id,
            handler: Arc::new(handler),
        });
        Subscription { id }
    }

    /// Remove a subscription. Returns false when it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.remove(subscription.id)
    }

    fn remove(&self, id: SubscriberId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter().position(|entry| entry.id == id) {
            Some(position) => {
                entries.remove(position);
                true
            }
            None => false,
        }
    }

    /// Invoke every subscriber in subscription order.
    ///
    /// Returns false when another broadcast was already running and this
    /// one was dropped. A panicking handler is logged and skipped; the
    /// remaining handlers still run.
    pub fn broadcast(&self, event: &E) -> bool {
        if self
            .broadcasting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let snapshot: Vec<Entry<E>> = self.entries.lock().unwrap().clone();
        for entry in &snapshot {
            let unsubscribe = || {
                self.remove(entry.id);
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                (entry.handler)(event, entry.id, &unsubscribe)
            }));
            if outcome.is_err() {
                warn!(subscriber = entry.id, "subscriber panicked during broadcast");
            }
        }

        self.broadcasting.store(false, Ordering::Release);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: ?Sized> Default for SubscriberList<E> {
    fn default() -> Self {
        Self::new()
    }
}
