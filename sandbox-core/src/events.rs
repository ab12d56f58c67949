//! Typed event publishers.
//!
//! Each component owns an `EventBus` for its event type. Listeners subscribe
//! and receive fully-formed event values; a listener can never fail the
//! publisher. Dropping the returned [`Subscription`] unregisters it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

type Listeners<E> = Arc<Mutex<HashMap<u64, UnboundedSender<E>>>>;

pub struct EventBus<E> {
    listeners: Listeners<E>,
    next_id: AtomicU64,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a listener. The subscription unregisters itself on drop.
    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().insert(id, tx);
        Subscription {
            id,
            listeners: self.listeners.clone(),
            rx,
        }
    }

    /// Deliver `event` to every live listener, pruning closed ones.
    pub fn emit(&self, event: E) {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of a subscription; unregisters from the bus when dropped.
pub struct Subscription<E> {
    id: u64,
    listeners: Listeners<E>,
    rx: UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Non-blocking drain of everything delivered so far.
    pub fn drain(&mut self) -> Vec<E> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            out.push(event);
        }
        out
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.listeners.lock().unwrap().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let bus: EventBus<u32> = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(7);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn drop_unregisters() {
        let bus: EventBus<u32> = EventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.listener_count(), 1);
        drop(sub);
        assert_eq!(bus.listener_count(), 0);
        // Emitting with no listeners is a no-op.
        bus.emit(1);
    }

    #[tokio::test]
    async fn drain_returns_buffered_events() {
        let bus: EventBus<&'static str> = EventBus::new();
        let mut sub = bus.subscribe();
        bus.emit("a");
        bus.emit("b");
        assert_eq!(sub.drain(), vec!["a", "b"]);
        assert!(sub.drain().is_empty());
    }
}
