//! Synchronous subscriber trait and registry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::event::ShardEvent;

/// Filter function type for event subscribers.
pub type EventFilter = Box<dyn Fn(&ShardEvent) -> bool + Send + Sync>;

/// Trait for synchronous event subscribers.
///
/// `on_event` runs on the shard's own task, so it must return quickly.
/// Use an [`EventReceiver`](crate::EventReceiver) for heavy processing.
pub trait EventSubscriber: Send + Sync {
    /// Called when an event is published.
    fn on_event(&self, event: &ShardEvent);

    /// Return `true` to receive the event. Accepts everything by default.
    fn accepts(&self, event: &ShardEvent) -> bool {
        let _ = event;
        true
    }

    /// Optional name for debugging.
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Registration handle for a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Registry for managing synchronous event subscribers.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<SubscriberId, Arc<dyn EventSubscriber>>>,
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscriber_count", &self.len())
            .finish()
    }
}

impl SubscriberRegistry {
    /// Create a new subscriber registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a subscriber.
    ///
    /// Returns a handle that can be used to unregister the subscriber.
    pub fn register(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriberId {
        let id = SubscriberId::new();
        let name = subscriber.name().to_string();

        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, subscriber);

        debug!(subscriber_name = %name, "Subscriber registered");
        id
    }

    /// Unregister a subscriber.
    ///
    /// Returns `true` if the subscriber was found and removed.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();

        if removed {
            debug!("Subscriber unregistered");
        }
        removed
    }

    /// Notify all accepting subscribers of an event.
    ///
    /// A panicking subscriber is logged and skipped; the others still run.
    pub fn notify(&self, event: &ShardEvent) {
        let subs = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        for (id, subscriber) in subs.iter() {
            if !subscriber.accepts(event) {
                continue;
            }
            trace!(
                subscriber_name = %subscriber.name(),
                event_type = %event.event_type(),
                "Notifying subscriber"
            );

            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                subscriber.on_event(event);
            }));

            if let Err(e) = result {
                warn!(
                    subscriber_id = ?id,
                    subscriber_name = %subscriber.name(),
                    error = ?e,
                    "Subscriber panicked"
                );
            }
        }
    }

    /// Get the number of registered subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all subscribers.
    pub fn clear(&self) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!("All subscribers cleared");
    }
}

/// A closure-backed subscriber with an optional filter.
pub struct FilterSubscriber<F>
where
    F: Fn(&ShardEvent) + Send + Sync,
{
    name: String,
    filter: Option<EventFilter>,
    handler: F,
}

impl<F> FilterSubscriber<F>
where
    F: Fn(&ShardEvent) + Send + Sync,
{
    /// Create a new filter subscriber.
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            filter: None,
            handler,
        }
    }

    /// Only deliver events matching `predicate`.
    #[must_use]
    pub fn with_filter<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ShardEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }
}

impl<F> EventSubscriber for FilterSubscriber<F>
where
    F: Fn(&ShardEvent) + Send + Sync,
{
    fn on_event(&self, event: &ShardEvent) {
        (self.handler)(event);
    }

    fn accepts(&self, event: &ShardEvent) -> bool {
        self.filter.as_ref().is_none_or(|f| f(event))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetadata;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSubscriber {
        count: AtomicUsize,
    }

    impl EventSubscriber for CountingSubscriber {
        fn on_event(&self, _event: &ShardEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingSubscriber;

    impl EventSubscriber for PanickingSubscriber {
        fn on_event(&self, _event: &ShardEvent) {
            panic!("subscriber blew up");
        }
    }

    fn opened(shard: u32) -> ShardEvent {
        ShardEvent::Opened {
            metadata: EventMetadata::new(shard, "test"),
        }
    }

    #[test]
    fn test_registry_register_unregister() {
        let registry = SubscriberRegistry::new();
        assert!(registry.is_empty());

        let id = registry.register(Arc::new(CountingSubscriber {
            count: AtomicUsize::new(0),
        }));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(id));
        assert!(registry.is_empty());
        assert!(!registry.unregister(id));
    }

    #[test]
    fn test_panicking_subscriber_does_not_block_others() {
        let registry = SubscriberRegistry::new();
        let counter = Arc::new(CountingSubscriber {
            count: AtomicUsize::new(0),
        });
        registry.register(Arc::new(PanickingSubscriber));
        registry.register(Arc::clone(&counter) as Arc<dyn EventSubscriber>);

        registry.notify(&opened(0));
        assert_eq!(counter.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_filter_subscriber() {
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = Arc::clone(&received);

        let subscriber = FilterSubscriber::new("errors_only", move |_event| {
            received_clone.fetch_add(1, Ordering::SeqCst);
        })
        .with_filter(ShardEvent::is_error);

        let registry = SubscriberRegistry::new();
        registry.register(Arc::new(subscriber));

        registry.notify(&opened(0));
        assert_eq!(received.load(Ordering::SeqCst), 0);

        registry.notify(&ShardEvent::Error {
            metadata: EventMetadata::new(0, "test"),
            message: "boom".into(),
        });
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registry_clear() {
        let registry = SubscriberRegistry::new();
        registry.register(Arc::new(PanickingSubscriber));
        registry.register(Arc::new(PanickingSubscriber));
        assert_eq!(registry.len(), 2);

        registry.clear();
        assert!(registry.is_empty());
    }
}
