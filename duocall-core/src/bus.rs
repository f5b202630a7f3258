//! In-process publish/subscribe
//!
//! Every component that produces events (signaling channel, peer connection,
//! membership, session) owns an `EventBus`. Subscribers receive their own
//! unbounded queue, optionally filtered, and are removed when their
//! `Subscription` is dropped or their receiver goes away.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::trace;

type Filter<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

struct Subscriber<E> {
    id: u64,
    filter: Option<Filter<E>>,
    sender: mpsc::UnboundedSender<E>,
}

struct BusInner<E> {
    name: &'static str,
    subscribers: Mutex<Vec<Subscriber<E>>>,
    next_id: AtomicU64,
}

impl<E> BusInner<E> {
    fn remove(&self, id: u64) {
        self.subscribers.lock().retain(|sub| sub.id != id);
    }
}

/// Fan-out event registry
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(BusInner {
                name,
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Receive every published event
    #[must_use]
    pub fn subscribe(&self) -> Subscription<E> {
        self.register(None)
    }

    /// Receive only the events `filter` accepts
    pub fn subscribe_filtered<F>(&self, filter: F) -> Subscription<E>
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.register(Some(Box::new(filter)))
    }

    fn register(&self, filter: Option<Filter<E>>) -> Subscription<E> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner.subscribers.lock().push(Subscriber { id, filter, sender });
        trace!(bus = self.inner.name, subscription_id = id, "Subscriber registered");

        Subscription {
            id,
            receiver,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every matching subscriber
    ///
    /// Returns the number of subscribers that received it. Subscribers whose
    /// receiver is gone are dropped from the registry.
    pub fn publish(&self, event: E) -> usize {
        let mut delivered = 0;
        let mut subscribers = self.inner.subscribers.lock();

        subscribers.retain(|sub| {
            if sub.filter.as_ref().is_some_and(|accept| !accept(&event)) {
                return !sub.sender.is_closed();
            }
            if sub.sender.send(event.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                trace!(bus = self.inner.name, subscription_id = sub.id, "Dropping closed subscriber");
                false
            }
        });

        delivered
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

/// Receiving end of an `EventBus` registration
///
/// Dropping it deregisters the subscriber.
pub struct Subscription<E> {
    id: u64,
    receiver: mpsc::UnboundedReceiver<E>,
    bus: Weak<BusInner<E>>,
}

impl<E> Subscription<E> {
    /// Wait for the next event; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<E> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.receiver.try_recv().ok()
    }

    /// Wait for the next event satisfying `predicate`, discarding the rest
    pub async fn next_matching<P>(&mut self, mut predicate: P) -> Option<E>
    where
        P: FnMut(&E) -> bool,
    {
        while let Some(event) = self.receiver.recv().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}
