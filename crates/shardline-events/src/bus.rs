//! Event bus for broadcasting shard events to subscribers.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::event::ShardEvent;
use crate::subscriber::SubscriberRegistry;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Event bus shared by every shard of a client.
///
/// Async receivers get events through a broadcast channel; synchronous
/// subscribers in the [`SubscriberRegistry`] are called inline on publish.
/// Clones share both the channel and the registry.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<ShardEvent>>,
    registry: Arc<SubscriberRegistry>,
    capacity: usize,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            registry: Arc::new(SubscriberRegistry::new()),
            capacity,
        }
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of async receivers that received the event.
    pub fn publish(&self, event: ShardEvent) -> usize {
        let event = Arc::new(event);

        trace!(
            event_type = %event.event_type(),
            shard_id = event.shard_id(),
            "Publishing event"
        );

        let count = self.sender.send(Arc::clone(&event)).unwrap_or(0);
        self.registry.notify(&event);
        count
    }

    /// Subscribe to events from every shard.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver::new(self.sender.subscribe(), None)
    }

    /// Subscribe to events produced by a single shard.
    #[must_use]
    pub fn subscribe_shard(&self, shard_id: u32) -> EventReceiver {
        EventReceiver::new(self.sender.subscribe(), Some(shard_id))
    }

    /// Get the synchronous subscriber registry.
    #[must_use]
    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    /// Number of active subscribers (async receivers plus registered
    /// synchronous subscribers).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender
            .receiver_count()
            .saturating_add(self.registry.len())
    }

    /// Check whether anyone is listening.
    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    /// Get the channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            registry: Arc::clone(&self.registry),
            capacity: self.capacity,
        }
    }
}

/// Receiver for events from the event bus.
pub struct EventReceiver {
    receiver: broadcast::Receiver<Arc<ShardEvent>>,
    /// When set, only events from this shard are yielded.
    shard_filter: Option<u32>,
}

impl EventReceiver {
    fn new(receiver: broadcast::Receiver<Arc<ShardEvent>>, shard_filter: Option<u32>) -> Self {
        Self {
            receiver,
            shard_filter,
        }
    }

    fn matches(&self, event: &ShardEvent) -> bool {
        self.shard_filter.is_none_or(|id| event.shard_id() == id)
    }

    /// Receive the next event.
    ///
    /// Returns `None` once every sender is gone. Lagged receivers log the
    /// number of dropped events and keep going.
    pub async fn recv(&mut self) -> Option<Arc<ShardEvent>> {
        let mut skipped: usize = 0;
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                    skipped = skipped.wrapping_add(1);
                    if skipped.is_multiple_of(100) {
                        tokio::task::yield_now().await;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(skipped = count, "Event receiver lagged, events dropped");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive the next event without blocking.
    pub fn try_recv(&mut self) -> Option<Arc<ShardEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                },
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    warn!(skipped = count, "Event receiver lagged, events dropped");
                },
                Err(
                    broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetadata;
    use crate::subscriber::FilterSubscriber;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn closed(shard: u32, code: u16) -> ShardEvent {
        ShardEvent::Closed {
            metadata: EventMetadata::new(shard, "test"),
            code,
        }
    }

    #[tokio::test]
    async fn test_event_bus_creation() {
        let bus = EventBus::with_capacity(100);
        assert_eq!(bus.capacity(), 100);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(!bus.has_subscribers());
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        assert_eq!(bus.publish(closed(0, 1006)), 1);

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event_type(), "closed");
    }

    #[tokio::test]
    async fn test_publish_without_receivers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(closed(0, 1000)), 0);
    }

    #[tokio::test]
    async fn test_shard_filter() {
        let bus = EventBus::new();
        let mut shard_one = bus.subscribe_shard(1);

        bus.publish(closed(0, 1000));
        bus.publish(closed(1, 4000));

        let event = shard_one.recv().await.unwrap();
        assert_eq!(event.shard_id(), 1);
        assert!(shard_one.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_sync_subscribers_count_as_listeners() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        bus.registry()
            .register(Arc::new(FilterSubscriber::new("counter", move |_| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            })));

        assert!(bus.has_subscribers());
        bus.publish(closed(0, 1000));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clone_shares_channel() {
        let bus = EventBus::new();
        let clone = bus.clone();
        let mut receiver = bus.subscribe();

        clone.publish(closed(2, 1000));
        assert_eq!(receiver.recv().await.unwrap().shard_id(), 2);
    }
}
