//! Per-instance event publishing
//!
//! Each policy instance owns an [`EventPublisher`] for its own event type.
//! Consumers are plain closures; they run synchronously on the publishing
//! task, after the policy has released its internal locks. Events published
//! from different threads are therefore not ordered relative to each other.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

type Consumer<Ev> = Arc<dyn Fn(&Ev) + Send + Sync>;

/// Fan-out of policy events to registered consumers
pub struct EventPublisher<Ev> {
    consumers: RwLock<Vec<Consumer<Ev>>>,
}

impl<Ev> EventPublisher<Ev> {
    pub fn new() -> Self {
        Self { consumers: RwLock::new(Vec::new()) }
    }

    /// Register a consumer for every future event
    pub fn subscribe<F>(&self, consumer: F)
    where
        F: Fn(&Ev) + Send + Sync + 'static,
    {
        self.consumers.write().push(Arc::new(consumer));
    }

    pub fn has_consumers(&self) -> bool {
        !self.consumers.read().is_empty()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    /// Deliver `event` to every consumer in registration order
    pub fn publish(&self, event: &Ev) {
        // Snapshot so consumers may subscribe without deadlocking.
        let consumers: Vec<Consumer<Ev>> = self.consumers.read().clone();
        for consumer in consumers {
            consumer(event);
        }
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = Ev>) {
        for event in events {
            self.publish(&event);
        }
    }
}

impl<Ev> Default for EventPublisher<Ev> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ev> fmt::Debug for EventPublisher<Ev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher").field("consumers", &self.consumer_count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_publish_reaches_all_consumers_in_order() {
        let publisher = EventPublisher::<u32>::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for id in 0..3 {
            let seen = Arc::clone(&seen);
            publisher.subscribe(move |ev: &u32| seen.lock().push((id, *ev)));
        }
        publisher.publish(&7);

        assert_eq!(*seen.lock(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn test_publish_without_consumers_is_noop() {
        let publisher = EventPublisher::<&'static str>::default();
        assert!(!publisher.has_consumers());
        publisher.publish(&"ignored");
    }

    #[test]
    fn test_publish_all() {
        let publisher = EventPublisher::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        publisher.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        publisher.publish_all([1, 2, 3]);

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
