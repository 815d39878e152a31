use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use shared::events::ChatEvent;
use tracing::trace;

type Handler = Arc<dyn Fn(&ChatEvent) + Send + Sync>;
type Predicate = Arc<dyn Fn(&ChatEvent) -> bool + Send + Sync>;

/// Conjunctive filter chain applied per subscription. An empty chain matches
/// every event.
#[derive(Clone, Default)]
pub struct EventFilter {
    predicates: Vec<Predicate>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Match events by their wire type tag, e.g. `"message.new"`.
    pub fn type_tag(tag: impl Into<String>) -> Self {
        Self::all().and_type_tag(tag)
    }

    pub fn predicate(predicate: impl Fn(&ChatEvent) -> bool + Send + Sync + 'static) -> Self {
        Self::all().and(predicate)
    }

    pub fn and(mut self, predicate: impl Fn(&ChatEvent) -> bool + Send + Sync + 'static) -> Self {
        self.predicates.push(Arc::new(predicate));
        self
    }

    pub fn and_type_tag(self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.and(move |event| event.type_tag() == tag)
    }

    fn matches(&self, event: &ChatEvent) -> bool {
        self.predicates.iter().all(|p| p(event))
    }
}

struct Entry {
    id: u64,
    filter: EventFilter,
    handler: Handler,
}

/// In-process pub/sub for domain events.
///
/// Delivery is FIFO in receipt order: `dispatch` serializes whole deliveries,
/// and the subscriber list is snapshotted per event, so unsubscribing during
/// delivery never affects the event currently being dispatched to others.
#[derive(Default)]
pub struct EventDispatcher {
    entries: Mutex<Vec<Arc<Entry>>>,
    delivery: Mutex<()>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(
        self: &Arc<Self>,
        filter: EventFilter,
        handler: impl Fn(&ChatEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            id,
            filter,
            handler: Arc::new(handler),
        });
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry);
        Subscription {
            id,
            dispatcher: Arc::downgrade(self),
        }
    }

    pub fn dispatch(&self, event: &ChatEvent) {
        // Holding the delivery guard across handler invocations is the sole
        // serialization point that yields a single global event order.
        let _delivery = self
            .delivery
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let snapshot: Vec<Arc<Entry>> = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        trace!(
            type_tag = event.type_tag(),
            subscribers = snapshot.len(),
            "dispatcher: delivering event"
        );
        for entry in snapshot {
            if entry.filter.matches(event) {
                (entry.handler)(event);
            }
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|entry| entry.id != id);
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Handle returned by `subscribe`. Takes effect no later than the next
/// dispatched event once `unsubscribe` is called.
pub struct Subscription {
    id: u64,
    dispatcher: Weak<EventDispatcher>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.unsubscribe(self.id);
        }
    }
}
