//! Fan-out publish/subscribe over bounded per-subscriber queues.
//!
//! [`Broadcaster::publish`] never waits on a subscriber. When a subscriber's
//! queue is full the value is dropped for that subscriber only, so a slow
//! consumer loses overflow messages but never stalls the producer or its
//! siblings. Values already queued are still delivered after the broadcaster
//! is closed; the subscription then yields `None`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};

/// Queue capacity used by [`Broadcaster::new`].
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 16;

/// Opaque subscriber handle.
pub type SubscriberId = u64;

type SubscriberMap<T> = Option<HashMap<SubscriberId, mpsc::Sender<T>>>;

struct Inner<T> {
    capacity: usize,
    next_id: AtomicU64,
    // `None` once closed
    subscribers: Mutex<SubscriberMap<T>>,
}

impl<T> Inner<T> {
    fn subscribers(&self) -> MutexGuard<'_, SubscriberMap<T>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, id: SubscriberId) {
        if let Some(map) = self.subscribers().as_mut() {
            map.remove(&id);
        }
    }
}

/// Thread-safe fan-out primitive. Cloning yields another handle to the same
/// set of subscribers.
pub struct Broadcaster<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(Some(HashMap::new())),
            }),
        }
    }

    /// Register a new bounded queue. Subscribing to a closed broadcaster
    /// returns a subscription that is already at end-of-stream.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        if let Some(map) = self.inner.subscribers().as_mut() {
            map.insert(id, tx);
        }

        Subscription {
            id,
            rx,
            owner: Arc::downgrade(&self.inner),
        }
    }

    /// Remove and close a subscriber queue. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner.remove(id);
    }

    /// Offer `value` to every current subscriber without blocking.
    pub fn publish(&self, value: T) {
        let mut guard = self.inner.subscribers();
        let Some(map) = guard.as_mut() else {
            return;
        };

        map.retain(|id, tx| match tx.try_send(value.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::trace!(subscriber = id, "Subscriber queue full, dropping message");
                true
            }
            // Receiver went away without unsubscribing
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Close every subscriber queue. Later publishes are no-ops.
    pub fn close(&self) {
        self.inner.subscribers().take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.subscribers().is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().as_ref().map_or(0, HashMap::len)
    }
}

/// Receiving side of one subscriber queue. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: SubscriberId,
    rx: mpsc::Receiver<T>,
    owner: Weak<Inner<T>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next value, or `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.remove(self.id);
        }
    }
}
