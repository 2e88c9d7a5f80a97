use crate::app::tasks::PeriodicTask;
use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);
pub const MIN_TTL: Duration = Duration::from_secs(1);
pub const DEFAULT_CAPACITY: usize = 10_000;
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A stored response replayed for repeated requests with the same key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdempotencyEntry {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub request_hash: String,
    pub inserted_at: Instant,
}

/// Outcome of [`IdempotencyStore::claim`].
pub enum Claim<'a> {
    /// A finished response is stored under the key.
    Stored(IdempotencyEntry),
    /// Another request holding the key has not finished yet.
    InFlight,
    /// The caller owns the key until the reservation is completed or dropped.
    Reserved(Reservation<'a>),
}

/// Marks a key as in flight. Dropping it without [`Reservation::complete`]
/// frees the key for a retry.
pub struct Reservation<'a> {
    store: &'a IdempotencyStore,
    key: String,
}

impl Reservation<'_> {
    pub fn complete(self, entry: IdempotencyEntry) {
        self.store.set(self.key.clone(), entry);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.store
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

pub struct IdempotencyStore {
    ttl: Duration,
    entries: Mutex<LruCache<String, IdempotencyEntry>>,
    in_flight: Mutex<HashSet<String>>,
    sweeper: Mutex<Option<Arc<PeriodicTask>>>,
}

impl IdempotencyStore {
    /// A zero TTL selects 24 hours; anything shorter than a second is raised
    /// to one second.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl.max(MIN_TTL) };
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashSet::new()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<IdempotencyEntry> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<IdempotencyEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = entries
            .peek(key)
            .map(|entry| now.duration_since(entry.inserted_at) >= self.ttl)?;
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get(key).cloned()
    }

    /// Returns the stored response for `key`, or reserves the key for the
    /// caller unless another request already holds it.
    pub fn claim(&self, key: &str) -> Claim<'_> {
        self.claim_at(key, Instant::now())
    }

    pub fn claim_at(&self, key: &str, now: Instant) -> Claim<'_> {
        // Lock order: entries, then in_flight.
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = entries
            .peek(key)
            .map(|entry| now.duration_since(entry.inserted_at) >= self.ttl);
        match expired {
            Some(true) => {
                entries.pop(key);
            }
            Some(false) => {
                if let Some(entry) = entries.get(key) {
                    return Claim::Stored(entry.clone());
                }
            }
            None => {}
        }
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(key.to_string()) {
            return Claim::InFlight;
        }
        Claim::Reserved(Reservation {
            store: self,
            key: key.to_string(),
        })
    }

    pub fn set(&self, key: String, entry: IdempotencyEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(key, entry);
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.inserted_at) >= self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub fn start_sweeper(self: &Arc<Self>, every: Duration) {
        let store = Arc::downgrade(self);
        let task = PeriodicTask::spawn("idempotency-sweep", every, move || {
            let store = store.clone();
            async move {
                if let Some(store) = store.upgrade() {
                    let swept = store.sweep_at(Instant::now());
                    if swept > 0 {
                        debug!(swept, "expired idempotency entries");
                    }
                }
            }
        });
        *self.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(task));
    }

    pub async fn stop(&self) {
        let task = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}
