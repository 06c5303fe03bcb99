//! Small publish/subscribe primitive used by [`crate::peer::MediaPeer`] for
//! its typed event streams.
//!
//! Subscribers receive events through an unbounded channel and hold a
//! [`Subscription`] handle; dropping or cancelling the handle detaches the
//! subscriber. Cancellation is always safe, including from a task that is
//! currently draining the stream.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

struct HubInner<T> {
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<T>>>,
    next_id: AtomicU64,
}

pub struct EventHub<T> {
    inner: Arc<HubInner<T>>,
}

impl<T> Clone for EventHub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for EventHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventHub<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> (Subscription<T>, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().insert(id, tx);
        (
            Subscription {
                id,
                hub: Arc::downgrade(&self.inner),
            },
            rx,
        )
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl<T: Clone> EventHub<T> {
    /// Deliver an event to every live subscriber, pruning closed ones.
    pub fn emit(&self, event: T) {
        self.inner
            .subscribers
            .lock()
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

/// Handle tying a subscriber to its hub; dropping it unsubscribes.
pub struct Subscription<T> {
    id: u64,
    hub: Weak<HubInner<T>>,
}

impl<T> Subscription<T> {
    pub fn cancel(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.subscribers.lock().remove(&self.id);
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let hub = EventHub::new();
        let (_sub_a, mut rx_a) = hub.subscribe();
        let (_sub_b, mut rx_b) = hub.subscribe();

        hub.emit(7u32);
        assert_eq!(rx_a.recv().await, Some(7));
        assert_eq!(rx_b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_clones_share_subscribers() {
        let hub = EventHub::new();
        let (_sub, mut rx) = hub.subscribe();

        hub.clone().emit(3u32);
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_cancel_detaches_subscriber() {
        let hub = EventHub::new();
        let (sub, mut rx) = hub.subscribe();

        hub.emit(1u32);
        assert_eq!(rx.recv().await, Some(1));

        sub.cancel();
        assert_eq!(hub.subscriber_count(), 0);
        hub.emit(2u32);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned_on_emit() {
        let hub = EventHub::new();
        let (_sub, rx) = hub.subscribe();
        drop(rx);

        hub.emit(1u32);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
