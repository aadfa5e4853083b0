//! Multi-subscriber fan-out for connection and session events.
//!
//! A [`Broadcaster`] keeps an observer list behind a lock. Publishing takes a
//! snapshot of the list and delivers after the lock is released, so a slow
//! subscriber never blocks subscribe/unsubscribe on other tasks. Delivery is
//! best-effort: a subscriber whose buffer is full misses the value.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("broadcaster closed")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;

struct Observers<T> {
    next_id: u64,
    subscribers: Vec<(u64, mpsc::Sender<T>)>,
    closed: bool,
}

impl<T> Observers<T> {
    fn remove(&mut self, id: u64) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        before != self.subscribers.len()
    }
}

pub struct Broadcaster<T> {
    observers: Arc<Mutex<Observers<T>>>,
    capacity: usize,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            observers: Arc::clone(&self.observers),
            capacity: self.capacity,
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
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            observers: Arc::new(Mutex::new(Observers {
                next_id: 0,
                subscribers: Vec::new(),
                closed: false,
            })),
            capacity: capacity.max(1),
        }
    }

    /// Registers a new subscriber, failing once the broadcaster is closed.
    pub fn try_subscribe(&self) -> BusResult<Subscription<T>> {
        let mut guard = self.observers.lock();
        if guard.closed {
            return Err(BusError::Closed);
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = guard.next_id;
        guard.next_id += 1;
        guard.subscribers.push((id, tx));
        Ok(Subscription {
            id,
            rx,
            owner: Arc::downgrade(&self.observers),
        })
    }

    /// Like [`Broadcaster::try_subscribe`], but a closed broadcaster hands out a
    /// subscription that is already finished, so `recv` yields `None` at once.
    pub fn subscribe(&self) -> Subscription<T> {
        self.try_subscribe().unwrap_or_else(|_| {
            let (_, rx) = mpsc::channel(1);
            Subscription {
                id: u64::MAX,
                rx,
                owner: Weak::new(),
            }
        })
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.observers.lock().remove(id)
    }

    /// Delivers `value` to every current subscriber and returns how many
    /// accepted it.
    pub fn publish(&self, value: T) -> usize {
        let snapshot: Vec<(u64, mpsc::Sender<T>)> = {
            let guard = self.observers.lock();
            if guard.closed {
                return 0;
            }
            guard.subscribers.clone()
        };

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, tx) in snapshot {
            match tx.try_send(value.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(id),
            }
        }

        if !gone.is_empty() {
            let mut guard = self.observers.lock();
            for id in gone {
                guard.remove(id);
            }
        }
        delivered
    }

    /// Ends every subscription. Values already buffered are still drained by
    /// their receivers before `recv` returns `None`.
    pub fn close(&self) {
        let mut guard = self.observers.lock();
        guard.closed = true;
        guard.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.observers.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.observers.lock().subscribers.len()
    }
}

/// Receiving half handed out by [`Broadcaster::subscribe`]. Dropping it
/// unsubscribes.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
    owner: Weak<Mutex<Observers<T>>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

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
            owner.lock().remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = Broadcaster::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.publish("ping".to_string()), 2);
        assert_eq!(a.recv().await.as_deref(), Some("ping"));
        assert_eq!(b.recv().await.as_deref(), Some("ping"));
    }

    #[tokio::test]
    async fn unsubscribed_handles_stop_receiving() {
        let bus = Broadcaster::new();
        let mut kept = bus.subscribe();
        let removed = bus.subscribe();
        assert!(bus.unsubscribe(removed.id()));
        assert_eq!(bus.publish(7u32), 1);
        assert_eq!(kept.recv().await, Some(7));
    }

    #[tokio::test]
    async fn dropping_a_subscription_unsubscribes() {
        let bus: Broadcaster<u32> = Broadcaster::new();
        {
            let _sub = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_ends_subscriptions_and_rejects_new_ones() {
        let bus = Broadcaster::new();
        let mut sub = bus.subscribe();
        bus.publish(1u8);
        bus.close();
        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, None);
        assert_eq!(bus.try_subscribe().err(), Some(BusError::Closed));
        let mut late = bus.subscribe();
        assert_eq!(late.recv().await, None);
        assert_eq!(bus.publish(2u8), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_misses_values_without_blocking_others() {
        let bus = Broadcaster::with_capacity(1);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();
        bus.publish(1u8);
        assert_eq!(fast.recv().await, Some(1));
        // `slow` still holds 1, so 2 is dropped for it only.
        assert_eq!(bus.publish(2u8), 1);
        assert_eq!(fast.recv().await, Some(2));
        assert_eq!(slow.recv().await, Some(1));
        assert_eq!(slow.try_recv(), None);
    }
}
