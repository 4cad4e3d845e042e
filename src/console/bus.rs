//! Fan-out of console and lifecycle events.
//!
//! Each subscriber owns a bounded queue. A subscriber that falls behind
//! loses its oldest events; publishers never wait on subscribers.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::event::ConsoleEvent;

/// Per-subscriber queue capacity.
pub const DEFAULT_CAPACITY: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFilter {
    All,
    Alias(String),
}

impl SubscriptionFilter {
    fn accepts(&self, event: &ConsoleEvent) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Alias(alias) => event.alias == *alias,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Arc<ConsoleEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber. Returns the number of receivers.
    pub fn publish(&self, event: ConsoleEvent) -> usize {
        // 구독자가 없으면 그냥 버림
        self.tx.send(Arc::new(event)).unwrap_or(0)
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter,
            cancel: CancellationToken::new(),
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Lazy, unbounded sequence of events. Ends after `unsubscribe`.
pub struct Subscription {
    rx: broadcast::Receiver<Arc<ConsoleEvent>>,
    filter: SubscriptionFilter,
    cancel: CancellationToken,
    dropped: u64,
}

impl Subscription {
    /// Next matching event, or `None` once unsubscribed.
    pub async fn next(&mut self) -> Option<Arc<ConsoleEvent>> {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                received = self.rx.recv() => received,
            };

            match received {
                Ok(event) if self.filter.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.dropped += skipped;
                    tracing::debug!("Subscriber lagged, dropped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    /// Token that ends this subscription from another task.
    pub fn canceller(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn filter(&self) -> &SubscriptionFilter {
        &self.filter
    }

    /// Events lost because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::EventKind;
    use std::time::Duration;

    fn event(alias: &str) -> ConsoleEvent {
        ConsoleEvent::new(alias, EventKind::Unmatched)
    }

    #[tokio::test]
    async fn test_filter_by_alias() {
        let bus = EventBus::default();
        let mut all = bus.subscribe(SubscriptionFilter::All);
        let mut only_a = bus.subscribe(SubscriptionFilter::Alias("a".into()));

        bus.publish(event("b"));
        bus.publish(event("a"));

        assert_eq!(all.next().await.unwrap().alias, "b");
        assert_eq!(all.next().await.unwrap().alias, "a");
        assert_eq!(only_a.next().await.unwrap().alias, "a");
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe(SubscriptionFilter::All);

        for i in 0..10 {
            bus.publish(ConsoleEvent::new(&format!("s{}", i), EventKind::Unmatched));
        }

        let first = sub.next().await.unwrap();
        assert_eq!(first.alias, "s6");
        assert_eq!(sub.dropped(), 6);
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_sequence() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(SubscriptionFilter::All);
        let cancel = sub.canceller();

        let waiter = tokio::spawn(async move { sub.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(event("a")), 0);
        let _sub = bus.subscribe(SubscriptionFilter::All);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.publish(event("a")), 1);
    }
}
