//! Publish/subscribe registry keyed by notification kind.

use super::{EventKind, SerialEvent};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A registered notification handler.
pub type EventSink = Arc<dyn Fn(&SerialEvent) + Send + Sync>;

/// Token returned by [`EventRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventRegistry {
    next_id: AtomicU64,
    sinks: RwLock<HashMap<EventKind, Vec<(SubscriptionId, EventSink)>>>,
}

impl EventRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe<F>(&self, kind: EventKind, sink: F) -> SubscriptionId
    where
        F: Fn(&SerialEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(sink)));
        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut sinks = self.sinks.write();
        for list in sinks.values_mut() {
            if let Some(pos) = list.iter().position(|(sid, _)| *sid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.sinks.read().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to every sink of its kind, synchronously. Returns the
    /// number of sinks invoked.
    pub fn publish(&self, event: &SerialEvent) -> usize {
        // Snapshot so sinks may subscribe or unsubscribe while running.
        let sinks: Vec<EventSink> = self
            .sinks
            .read()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, sink)| Arc::clone(sink)).collect())
            .unwrap_or_default();
        for sink in &sinks {
            sink(event);
        }
        sinks.len()
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sinks = self.sinks.read();
        f.debug_struct("EventRegistry")
            .field("data", &sinks.get(&EventKind::Data).map_or(0, Vec::len))
            .field("error", &sinks.get(&EventKind::Error).map_or(0, Vec::len))
            .field("pin_changed", &sinks.get(&EventKind::PinChanged).map_or(0, Vec::len))
            .finish()
    }
}
