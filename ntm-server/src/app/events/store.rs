use crate::app::tasks::PeriodicTask;
use crate::domain::events::{BusEvent, DropReason, DroppedEventRecord, TopicGlob};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_BUFFER_SIZE: usize = 10_000;
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
pub const DROPPED_RETENTION: Duration = Duration::from_secs(24 * 3600);
pub const DEFAULT_REPLAY_LIMIT: usize = 1000;
const RECENT_DROPPED_CAPACITY: usize = 256;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY,
    topic TEXT NOT NULL,
    event_type TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_topic_seq ON events(topic, seq);
CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);
CREATE TABLE IF NOT EXISTS dropped_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id TEXT NOT NULL,
    topic TEXT NOT NULL,
    reason TEXT NOT NULL,
    first_seq INTEGER NOT NULL,
    last_seq INTEGER NOT NULL,
    count INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dropped_created_at ON dropped_events(created_at);
";

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("invalid event store config: {0}")]
    InvalidConfig(String),
    #[error("event database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("corrupt event row {seq}: {message}")]
    Corrupt { seq: u64, message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventStoreConfig {
    pub buffer_size: usize,
    pub retention: Duration,
    pub cleanup_interval: Duration,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            retention: DEFAULT_RETENTION,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl EventStoreConfig {
    /// Zero selects the default; negative values are rejected.
    pub fn from_raw(
        buffer_size: i64,
        retention_secs: i64,
        cleanup_secs: i64,
    ) -> Result<Self, EventStoreError> {
        fn pick(name: &str, value: i64, default: u64) -> Result<u64, EventStoreError> {
            match value {
                v if v < 0 => Err(EventStoreError::InvalidConfig(format!(
                    "{name} must not be negative (got {v})"
                ))),
                0 => Ok(default),
                v => Ok(v as u64),
            }
        }
        Ok(Self {
            buffer_size: pick("buffer_size", buffer_size, DEFAULT_BUFFER_SIZE as u64)? as usize,
            retention: Duration::from_secs(pick(
                "retention",
                retention_secs,
                DEFAULT_RETENTION.as_secs(),
            )?),
            cleanup_interval: Duration::from_secs(pick(
                "cleanup_interval",
                cleanup_secs,
                DEFAULT_CLEANUP_INTERVAL.as_secs(),
            )?),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Replay {
    pub events: Vec<BusEvent>,
    pub reset: bool,
}

struct Ring {
    slots: Vec<Option<BusEvent>>,
    current: u64,
    first_in_ring: Option<u64>,
}

impl Ring {
    fn new(size: usize, current: u64) -> Self {
        Self {
            slots: vec![None; size.max(1)],
            current,
            first_in_ring: None,
        }
    }

    fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    fn insert(&mut self, event: BusEvent) {
        let index = (event.seq % self.capacity()) as usize;
        self.first_in_ring.get_or_insert(event.seq);
        self.slots[index] = Some(event);
    }

    fn min_seq(&self) -> Option<u64> {
        let first = self.first_in_ring?;
        Some(first.max(self.current.saturating_sub(self.capacity() - 1)))
    }

    fn get(&self, seq: u64) -> Option<&BusEvent> {
        self.slots[(seq % self.capacity()) as usize]
            .as_ref()
            .filter(|event| event.seq == seq)
    }
}

/// Sequenced event log: a fixed ring of recent events plus optional SQLite
/// persistence for replay beyond the ring.
pub struct WsEventStore {
    config: EventStoreConfig,
    ring: Mutex<Ring>,
    db: Option<Mutex<Connection>>,
    recent_dropped: Mutex<VecDeque<DroppedEventRecord>>,
    cleanup: Mutex<Option<Arc<PeriodicTask>>>,
}

impl WsEventStore {
    pub fn memory(config: EventStoreConfig) -> Self {
        Self::build(config, None, 0)
    }

    pub fn with_db(config: EventStoreConfig, conn: Connection) -> Result<Self, EventStoreError> {
        conn.execute_batch(SCHEMA)?;
        let max: i64 = conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM events", [], |row| {
            row.get(0)
        })?;
        if max > 0 {
            info!(resume_seq = max + 1, "event store resuming from persisted sequence");
        }
        Ok(Self::build(config, Some(conn), max as u64))
    }

    fn build(config: EventStoreConfig, db: Option<Connection>, current: u64) -> Self {
        Self {
            ring: Mutex::new(Ring::new(config.buffer_size, current)),
            config,
            db: db.map(Mutex::new),
            recent_dropped: Mutex::new(VecDeque::with_capacity(RECENT_DROPPED_CAPACITY)),
            cleanup: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EventStoreConfig {
        &self.config
    }

    pub fn is_persistent(&self) -> bool {
        self.db.is_some()
    }

    pub fn current_seq(&self) -> u64 {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner).current
    }

    /// Assigns the next sequence and records the event. Persistence failures
    /// are logged; the event is returned regardless.
    pub fn store(&self, topic: &str, event_type: &str, data: Value) -> BusEvent {
        let event = {
            let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
            ring.current += 1;
            let event = BusEvent {
                seq: ring.current,
                topic: topic.to_string(),
                event_type: event_type.to_string(),
                data,
                created_at: Utc::now(),
            };
            ring.insert(event.clone());
            event
        };

        if let Some(db) = &self.db {
            let conn = db.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = persist_event(&conn, &event) {
                warn!(%err, seq = event.seq, topic = %event.topic, "failed to persist event");
            }
        }
        event
    }

    /// Events with `seq > since` matching `glob`, oldest first.
    pub fn get_since(
        &self,
        since: u64,
        glob: &TopicGlob,
        limit: usize,
    ) -> Result<Replay, EventStoreError> {
        let limit = if limit == 0 { DEFAULT_REPLAY_LIMIT } else { limit };

        let (ring_min, from_ring) = {
            let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
            match ring.min_seq() {
                None => (None, Vec::new()),
                Some(min) => {
                    let start = min.max(since.saturating_add(1));
                    let events: Vec<BusEvent> = (start..=ring.current)
                        .filter_map(|seq| ring.get(seq))
                        .filter(|event| glob.matches(&event.topic))
                        .take(limit)
                        .cloned()
                        .collect();
                    (Some(min), events)
                }
            }
        };

        match ring_min {
            None => {
                let events = match &self.db {
                    Some(db) => {
                        let conn = db.lock().unwrap_or_else(PoisonError::into_inner);
                        query_events(&conn, since, None, glob, limit)?
                    }
                    None => Vec::new(),
                };
                Ok(Replay {
                    events,
                    reset: false,
                })
            }
            Some(min) if since.saturating_add(1) >= min => Ok(Replay {
                events: from_ring,
                reset: false,
            }),
            Some(min) => {
                let mut events = match &self.db {
                    Some(db) => {
                        let conn = db.lock().unwrap_or_else(PoisonError::into_inner);
                        query_events(&conn, since, Some(min), glob, limit)?
                    }
                    None => Vec::new(),
                };
                if events.is_empty() {
                    return Ok(Replay {
                        events,
                        reset: true,
                    });
                }
                events.extend(from_ring);
                events.truncate(limit);
                Ok(Replay {
                    events,
                    reset: false,
                })
            }
        }
    }

    pub fn record_dropped(
        &self,
        client_id: &str,
        topic: &str,
        reason: DropReason,
        first_seq: u64,
        last_seq: u64,
        count: u64,
    ) {
        let record = DroppedEventRecord {
            client_id: client_id.to_string(),
            topic: topic.to_string(),
            reason,
            first_seq,
            last_seq,
            count,
            created_at: Utc::now(),
        };
        warn!(
            client = %client_id,
            topic = %topic,
            reason = reason.as_str(),
            first_seq,
            last_seq,
            count,
            "events dropped"
        );

        if let Some(db) = &self.db {
            let conn = db.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = conn.execute(
                "INSERT INTO dropped_events (client_id, topic, reason, first_seq, last_seq, count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.client_id,
                    record.topic,
                    reason.as_str(),
                    first_seq as i64,
                    last_seq as i64,
                    count as i64,
                    record.created_at.timestamp_millis()
                ],
            ) {
                warn!(%err, "failed to persist dropped-event record");
            }
        }

        let mut recent = self
            .recent_dropped
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if recent.len() == RECENT_DROPPED_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(record);
    }

    /// Most recent dropped-event records, newest first.
    pub fn dropped(&self, limit: usize) -> Result<Vec<DroppedEventRecord>, EventStoreError> {
        let limit = if limit == 0 { 100 } else { limit };
        if let Some(db) = &self.db {
            let conn = db.lock().unwrap_or_else(PoisonError::into_inner);
            let mut stmt = conn.prepare(
                "SELECT client_id, topic, reason, first_seq, last_seq, count, created_at
                 FROM dropped_events ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                let reason: String = row.get(2)?;
                let created: i64 = row.get(6)?;
                Ok(DroppedEventRecord {
                    client_id: row.get(0)?,
                    topic: row.get(1)?,
                    reason: reason.parse().unwrap_or(DropReason::BufferFull),
                    first_seq: row.get::<_, i64>(3)? as u64,
                    last_seq: row.get::<_, i64>(4)? as u64,
                    count: row.get::<_, i64>(5)? as u64,
                    created_at: millis_to_datetime(created),
                })
            })?;
            return Ok(rows.collect::<Result<Vec<_>, _>>()?);
        }
        Ok(self
            .recent_dropped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    /// Deletes persisted events older than the retention and dropped-event
    /// rows older than 24 hours, measured from `now`.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> Result<(usize, usize), EventStoreError> {
        let Some(db) = &self.db else {
            return Ok((0, 0));
        };
        let event_cutoff = now.timestamp_millis() - self.config.retention.as_millis() as i64;
        let dropped_cutoff = now.timestamp_millis() - DROPPED_RETENTION.as_millis() as i64;
        let conn = db.lock().unwrap_or_else(PoisonError::into_inner);
        let events = conn.execute(
            "DELETE FROM events WHERE created_at < ?1",
            params![event_cutoff],
        )?;
        let dropped = conn.execute(
            "DELETE FROM dropped_events WHERE created_at < ?1",
            params![dropped_cutoff],
        )?;
        Ok((events, dropped))
    }

    pub fn start_cleanup(self: &Arc<Self>) {
        if self.db.is_none() {
            return;
        }
        let store = Arc::downgrade(self);
        let task = PeriodicTask::spawn(
            "event-store-cleanup",
            self.config.cleanup_interval,
            move || {
                let store = store.clone();
                async move {
                    let Some(store) = store.upgrade() else {
                        return;
                    };
                    match store.cleanup_at(Utc::now()) {
                        Ok((events, dropped)) if events + dropped > 0 => {
                            info!(events, dropped, "event store cleanup");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "event store cleanup failed"),
                    }
                }
            },
        );
        *self.cleanup.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(task));
    }

    pub async fn stop(&self) {
        let task = self
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

fn persist_event(conn: &Connection, event: &BusEvent) -> Result<(), EventStoreError> {
    conn.execute(
        "INSERT INTO events (seq, topic, event_type, data, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            event.seq as i64,
            event.topic,
            event.event_type,
            event.data.to_string(),
            event.created_at.timestamp_millis()
        ],
    )?;
    Ok(())
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn query_events(
    conn: &Connection,
    since: u64,
    before: Option<u64>,
    glob: &TopicGlob,
    limit: usize,
) -> Result<Vec<BusEvent>, EventStoreError> {
    use rusqlite::types::Value as SqlValue;

    let mut sql = String::from(
        "SELECT seq, topic, event_type, data, created_at FROM events WHERE seq > ?",
    );
    let mut values = vec![SqlValue::Integer(since as i64)];
    if let Some(before) = before {
        sql.push_str(" AND seq < ?");
        values.push(SqlValue::Integer(before as i64));
    }
    match glob {
        TopicGlob::All => {}
        TopicGlob::Exact(topic) => {
            sql.push_str(" AND topic = ?");
            values.push(SqlValue::Text(topic.clone()));
        }
        TopicGlob::Prefix(prefix) => {
            sql.push_str(" AND topic LIKE ? ESCAPE '\\'");
            values.push(SqlValue::Text(format!("{}:%", escape_like(prefix))));
        }
    }
    sql.push_str(" ORDER BY seq ASC LIMIT ?");
    values.push(SqlValue::Integer(limit as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, i64>(4)?,
        ))
    })?;

    let mut events = Vec::new();
    for row in rows {
        let (seq, topic, event_type, data, created_at) = row?;
        let data = serde_json::from_str(&data).map_err(|err| EventStoreError::Corrupt {
            seq: seq as u64,
            message: err.to_string(),
        })?;
        events.push(BusEvent {
            seq: seq as u64,
            topic,
            event_type,
            data,
            created_at: millis_to_datetime(created_at),
        });
    }
    Ok(events)
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::path::Path;

    fn small(buffer: usize) -> EventStoreConfig {
        EventStoreConfig {
            buffer_size: buffer,
            ..EventStoreConfig::default()
        }
    }

    fn glob(value: &str) -> TopicGlob {
        value.parse().unwrap()
    }

    fn memory_db() -> Connection {
        sqlite::open(Path::new(sqlite::IN_MEMORY)).unwrap()
    }

    #[test]
    fn config_coerces_zero_and_rejects_negative() {
        let config = EventStoreConfig::from_raw(0, 0, 0).unwrap();
        assert_eq!(config, EventStoreConfig::default());
        let config = EventStoreConfig::from_raw(16, 60, 5).unwrap();
        assert_eq!(config.buffer_size, 16);
        assert_eq!(config.retention, Duration::from_secs(60));
        assert!(EventStoreConfig::from_raw(-1, 0, 0).is_err());
        assert!(EventStoreConfig::from_raw(0, 0, -5).is_err());
    }

    #[test]
    fn concurrent_stores_get_unique_contiguous_sequences() {
        let store = Arc::new(WsEventStore::memory(small(64)));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = store.clone();
                std::thread::spawn(move || {
                    (0..250)
                        .map(|i| store.store("system", "tick", json!({"w": worker, "i": i})).seq)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seqs: Vec<u64> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=2000).collect::<Vec<_>>());
        assert_eq!(store.current_seq(), 2000);
    }

    #[test]
    fn sequence_resumes_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        {
            let store =
                WsEventStore::with_db(small(8), sqlite::open(&path).unwrap()).unwrap();
            for _ in 0..5 {
                store.store("sessions:a", "session.updated", json!({}));
            }
        }
        let store = WsEventStore::with_db(small(8), sqlite::open(&path).unwrap()).unwrap();
        assert_eq!(store.current_seq(), 5);
        assert_eq!(store.store("sessions:a", "session.updated", json!({})).seq, 6);

        let replay = store.get_since(0, &glob("sessions:*"), 0).unwrap();
        assert!(!replay.reset);
        assert_eq!(
            replay.events.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5, 6]
        );
    }

    #[test]
    fn ring_serves_recent_cursor() {
        let store = WsEventStore::memory(small(4));
        for i in 0..20 {
            store.store(&format!("sessions:s{}", i % 2), "tick", json!({"i": i}));
        }
        let replay = store.get_since(16, &TopicGlob::All, 0).unwrap();
        assert!(!replay.reset);
        assert_eq!(
            replay.events.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![17, 18, 19, 20]
        );
        let replay = store.get_since(16, &glob("sessions:s0"), 0).unwrap();
        assert_eq!(
            replay.events.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![17, 19]
        );
    }

    #[test]
    fn stale_cursor_without_history_resets() {
        for store in [
            WsEventStore::memory(small(4)),
            WsEventStore::with_db(small(4), memory_db()).unwrap(),
        ] {
            for i in 0..20 {
                store.store("sessions:bar", "tick", json!({"i": i}));
            }
            let replay = store.get_since(0, &glob("sessions:foo"), 0).unwrap();
            assert!(replay.reset);
            assert!(replay.events.is_empty());
        }
    }

    #[test]
    fn database_fills_gap_before_ring() {
        let store = WsEventStore::with_db(small(4), memory_db()).unwrap();
        for i in 0..20 {
            store.store(&format!("panes:p:{}", i % 3), "pane.output", json!({"i": i}));
        }
        let replay = store.get_since(2, &glob("panes:*"), 0).unwrap();
        assert!(!replay.reset);
        assert_eq!(
            replay.events.iter().map(|e| e.seq).collect::<Vec<_>>(),
            (3..=20).collect::<Vec<_>>()
        );
        let limited = store.get_since(2, &TopicGlob::All, 5).unwrap();
        assert_eq!(limited.events.len(), 5);
        assert_eq!(limited.events[0].seq, 3);
    }

    #[test]
    fn like_metacharacters_in_prefix_are_literal() {
        let store = WsEventStore::with_db(small(1), memory_db()).unwrap();
        store.store("a_b:1", "t", json!({}));
        store.store("axb:1", "t", json!({}));
        store.store("z", "t", json!({}));
        store.store("z", "t", json!({}));
        let replay = store.get_since(0, &glob("a_b:*"), 0).unwrap();
        assert_eq!(replay.events.len(), 1);
        assert_eq!(replay.events[0].topic, "a_b:1");
    }

    #[test]
    fn cleanup_honours_retention() {
        let store = WsEventStore::with_db(
            EventStoreConfig {
                buffer_size: 4,
                retention: Duration::from_secs(60),
                cleanup_interval: Duration::from_secs(1),
            },
            memory_db(),
        )
        .unwrap();
        store.store("system", "tick", json!({}));
        store.record_dropped("c1", "system", DropReason::BufferFull, 1, 1, 1);

        assert_eq!(store.cleanup_at(Utc::now()).unwrap(), (0, 0));
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(store.cleanup_at(later).unwrap(), (1, 0));
        let much_later = Utc::now() + chrono::Duration::hours(25);
        assert_eq!(store.cleanup_at(much_later).unwrap(), (0, 1));
    }

    #[test]
    fn dropped_records_are_listed_newest_first() {
        for store in [
            WsEventStore::memory(small(4)),
            WsEventStore::with_db(small(4), memory_db()).unwrap(),
        ] {
            store.record_dropped("c1", "sessions:a", DropReason::BufferFull, 3, 7, 5);
            store.record_dropped("c2", "approvals", DropReason::HubOverflow, 9, 9, 1);
            let dropped = store.dropped(10).unwrap();
            assert_eq!(dropped.len(), 2);
            assert_eq!(dropped[0].client_id, "c2");
            assert_eq!(dropped[1].count, 5);
        }
    }

    #[tokio::test]
    async fn cleanup_task_stops_cleanly() {
        let store = Arc::new(WsEventStore::with_db(small(4), memory_db()).unwrap());
        store.start_cleanup();
        store.stop().await;
        store.stop().await;
    }

    proptest! {
        #[test]
        fn replay_with_database_matches_full_history(
            buffer in 1usize..8,
            topics in proptest::collection::vec(0u8..3, 0..40),
            since in 0u64..45,
            filter in 0u8..4,
        ) {
            let store = WsEventStore::with_db(small(buffer), memory_db()).unwrap();
            let names = ["sessions:a", "sessions:b", "approvals"];
            for t in &topics {
                store.store(names[*t as usize], "evt", json!({}));
            }
            let glob = match filter {
                0 => TopicGlob::All,
                1 => glob("sessions:*"),
                2 => glob("sessions:a"),
                _ => glob("approvals"),
            };
            let expected: Vec<u64> = topics
                .iter()
                .enumerate()
                .map(|(i, t)| (i as u64 + 1, names[*t as usize]))
                .filter(|(seq, topic)| *seq > since && glob.matches(topic))
                .map(|(seq, _)| seq)
                .collect();

            let replay = store.get_since(since, &glob, 0).unwrap();
            let got: Vec<u64> = replay.events.iter().map(|e| e.seq).collect();
            if replay.reset {
                prop_assert!(got.is_empty());
                let ring_min = (topics.len() as u64).saturating_sub(buffer as u64 - 1).max(1);
                let gap_has_match = expected.iter().any(|seq| *seq < ring_min);
                prop_assert!(!gap_has_match);
            } else {
                prop_assert_eq!(got.clone(), expected);
            }
            let unique: HashSet<u64> = got.iter().copied().collect();
            prop_assert_eq!(unique.len(), got.len());
        }
    }
}
