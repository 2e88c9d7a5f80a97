use crate::app::events::EventSink;
use crate::domain::events::{BusEvent, TopicGlob};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

pub const SSE_CLIENT_BUFFER: usize = 64;

struct SseClient {
    globs: Vec<TopicGlob>,
    tx: mpsc::Sender<BusEvent>,
}

/// Server-sent-event fan-out. A full client channel loses the event.
pub struct SseBroadcaster {
    clients: Mutex<HashMap<u64, SseClient>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Default for SseBroadcaster {
    fn default() -> Self {
        Self::new(SSE_CLIENT_BUFFER)
    }
}

impl SseBroadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Registers a client; an empty glob list receives everything.
    pub fn subscribe(self: &Arc<Self>, globs: Vec<TopicGlob>) -> SseSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, SseClient { globs, tx });
        debug!(client = id, "sse client connected");
        SseSubscription {
            id,
            rx,
            owner: self.clone(),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn close(&self) {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn remove(&self, id: u64) {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        debug!(client = id, "sse client disconnected");
    }
}

impl EventSink for SseBroadcaster {
    fn name(&self) -> &'static str {
        "sse"
    }

    fn deliver(&self, event: &BusEvent) {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.retain(|_, client| {
            if !client.globs.is_empty() && !client.globs.iter().any(|glob| glob.matches(&event.topic)) {
                return true;
            }
            !matches!(
                client.tx.try_send(event.clone()),
                Err(TrySendError::Closed(_))
            )
        });
    }
}

/// Receiving half of an SSE client; dropping it unregisters the client.
pub struct SseSubscription {
    id: u64,
    rx: mpsc::Receiver<BusEvent>,
    owner: Arc<SseBroadcaster>,
}

impl SseSubscription {
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }
}

impl Drop for SseSubscription {
    fn drop(&mut self) {
        self.owner.remove(self.id);
    }
}
