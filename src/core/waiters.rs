//! One-shot waiters keyed by predicate
//!
//! Command response matchers and script waits register a predicate and get
//! a oneshot receiver back. Every offered item is checked against every
//! waiter in registration order, so one line can satisfy several waiters.
//! The returned [`WaiterGuard`] retires the waiter when dropped, which is
//! how timeouts and cancellation release their registrations.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send>;

struct Waiter<T> {
    id: u64,
    predicate: Predicate<T>,
    tx: oneshot::Sender<T>,
}

struct Inner<T> {
    next_id: u64,
    waiters: Vec<Waiter<T>>,
    closed: bool,
}

/// Set of pending waiters for items of type `T`
pub struct WaiterSet<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: Clone + Send + 'static> WaiterSet<T> {
    /// Create empty set
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                waiters: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Register a waiter. The receiver resolves with the first offered item
    /// satisfying `predicate`, or errors once the set is closed.
    pub fn register<F>(&self, predicate: F) -> (WaiterGuard<T>, oneshot::Receiver<T>)
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        // A closed set drops the sender right away so the receiver errors
        if !inner.closed {
            inner.waiters.push(Waiter {
                id,
                predicate: Box::new(predicate),
                tx,
            });
        }

        let guard = WaiterGuard {
            id,
            inner: Arc::downgrade(&self.inner),
        };
        (guard, rx)
    }

    /// Offer an item to every pending waiter. Returns how many were resolved.
    pub fn offer(&self, item: &T) -> usize {
        let mut inner = self.inner.lock();
        let mut resolved = 0;
        let mut kept = Vec::with_capacity(inner.waiters.len());

        for waiter in inner.waiters.drain(..) {
            if waiter.tx.is_closed() {
                continue;
            }
            if (waiter.predicate)(item) {
                if waiter.tx.send(item.clone()).is_ok() {
                    resolved += 1;
                }
            } else {
                kept.push(waiter);
            }
        }

        inner.waiters = kept;
        resolved
    }

    /// Drop every waiter and refuse new ones
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.waiters.clear();
    }

    /// Whether the set was closed
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of pending waiters
    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Whether there are no pending waiters
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + 'static> Default for WaiterSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for WaiterSet<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Retires its waiter when dropped
pub struct WaiterGuard<T> {
    id: u64,
    inner: Weak<Mutex<Inner<T>>>,
}

impl<T> Drop for WaiterGuard<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let id = self.id;
            inner.lock().waiters.retain(|w| w.id != id);
        }
    }
}

impl<T> std::fmt::Debug for WaiterGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaiterGuard").field("id", &self.id).finish()
    }
}
