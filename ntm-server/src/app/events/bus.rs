use super::store::WsEventStore;
use crate::domain::events::BusEvent;
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::trace;

/// A fan-out target. `deliver` must not block the publisher.
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn deliver(&self, event: &BusEvent);
}

/// In-process fan-out: every publish is sequenced by the event store first,
/// then handed to each registered sink.
pub struct EventBus {
    store: Arc<WsEventStore>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    pub fn new(store: Arc<WsEventStore>) -> Self {
        Self {
            store,
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, sink: Arc<dyn EventSink>) {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    pub fn store(&self) -> &Arc<WsEventStore> {
        &self.store
    }

    pub fn current_seq(&self) -> u64 {
        self.store.current_seq()
    }

    pub fn publish(&self, topic: &str, event_type: &str, data: Value) -> BusEvent {
        let event = self.store.store(topic, event_type, data);
        let sinks = self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for sink in sinks {
            trace!(sink = sink.name(), seq = event.seq, topic = %event.topic, "deliver");
            sink.deliver(&event);
        }
        event
    }

    /// Publishes the same payload on each topic in order.
    pub fn publish_all(&self, topics: &[&str], event_type: &str, data: Value) -> Vec<BusEvent> {
        topics
            .iter()
            .map(|topic| self.publish(topic, event_type, data.clone()))
            .collect()
    }
}
