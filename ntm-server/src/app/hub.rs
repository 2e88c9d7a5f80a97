use crate::app::events::{EventSink, WsEventStore};
use crate::domain::events::{BusEvent, DropReason, TopicGlob};
use crate::domain::rbac::{AuthMode, Identity, Permissions};
use crate::telemetry::ServerMetrics;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const HUB_CLIENT_ID: &str = "hub";

/// Topic namespaces and the permission each one needs.
const NAMESPACES: &[(&str, Permissions)] = &[
    ("sessions", Permissions::READ_SESSIONS),
    ("panes", Permissions::READ_SESSIONS),
    ("approvals", Permissions::READ_APPROVALS),
    ("jobs", Permissions::READ_JOBS),
    ("safety", Permissions::READ_SAFETY),
    ("checkpoints", Permissions::READ_CHECKPOINTS),
    ("pipelines", Permissions::READ_PIPELINES),
    ("scanner", Permissions::READ_INTEGRATIONS),
    ("accounts", Permissions::READ_INTEGRATIONS),
    ("system", Permissions::READ_HEALTH),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HubConfig {
    pub inbox_capacity: usize,
    pub client_buffer: usize,
    /// Drops tolerated within `drop_window` before the client is disconnected.
    pub drop_threshold: usize,
    pub drop_window: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 256,
            client_buffer: 16,
            drop_threshold: 32,
            drop_window: Duration::from_secs(10),
            ping_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(30),
        }
    }
}

pub type Frame = Arc<str>;

/// Builds a server frame. Every frame carries the current bus sequence.
pub fn frame(kind: &str, seq: u64, fields: Value) -> Frame {
    let mut object = match fields {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".into(), other);
            map
        }
    };
    object.insert("type".into(), Value::String(kind.to_string()));
    object.insert("seq".into(), json!(seq));
    Value::Object(object).to_string().into()
}

pub fn event_frame(event: &BusEvent) -> Frame {
    frame(
        "event",
        event.seq,
        json!({
            "topic": event.topic,
            "event_type": event.event_type,
            "data": event.data,
            "timestamp": event.created_at,
        }),
    )
}

/// Resolves requested topics against the caller's permissions. `*` is kept
/// only for callers holding `system-config`; everyone else gets the
/// namespaces they may read.
pub fn authorize_topics(identity: &Identity, requested: &[String]) -> Result<Vec<TopicGlob>, String> {
    if requested.is_empty() {
        return Err("topics must not be empty".into());
    }
    let allowed: Vec<TopicGlob> = NAMESPACES
        .iter()
        .filter(|(_, permission)| identity.has(*permission))
        .flat_map(|(namespace, _)| {
            [
                TopicGlob::Exact(namespace.to_string()),
                TopicGlob::Prefix(namespace.to_string()),
            ]
        })
        .collect();

    let mut granted = Vec::new();
    for raw in requested {
        let glob: TopicGlob = raw.parse()?;
        if glob.is_all() {
            if identity.has(Permissions::SYSTEM_CONFIG) {
                granted.push(TopicGlob::All);
            } else {
                granted.extend(allowed.iter().cloned());
            }
            continue;
        }
        if !allowed.iter().any(|mine| mine.covers(&glob)) {
            return Err(format!("not permitted to subscribe to '{glob}'"));
        }
        granted.push(glob);
    }
    let mut unique = Vec::with_capacity(granted.len());
    for glob in granted {
        if !unique.contains(&glob) {
            unique.push(glob);
        }
    }
    Ok(unique)
}

/// Origin rules for the upgrade: no header is fine, configured origins are
/// fine, and loopback origins are fine only in local auth mode.
pub fn origin_allowed(origin: Option<&str>, allowed: &[String], mode: AuthMode) -> bool {
    let Some(origin) = origin.map(str::trim).filter(|origin| !origin.is_empty()) else {
        return true;
    };
    if allowed
        .iter()
        .any(|candidate| candidate == "*" || candidate.trim_end_matches('/').eq_ignore_ascii_case(origin.trim_end_matches('/')))
    {
        return true;
    }
    mode == AuthMode::Local && is_loopback_origin(origin)
}

fn is_loopback_origin(origin: &str) -> bool {
    let rest = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin);
    let authority = rest.split('/').next().unwrap_or_default();
    let host = if let Some(v6) = authority.strip_prefix('[') {
        v6.split(']').next().unwrap_or_default()
    } else {
        authority.split(':').next().unwrap_or_default()
    };
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<std::net::IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

struct DropRun {
    topic: String,
    first: u64,
    last: u64,
    count: u64,
}

struct Client {
    identity: Identity,
    origin: Option<String>,
    globs: Vec<TopicGlob>,
    tx: mpsc::Sender<Frame>,
    run: Option<DropRun>,
    recent_drops: VecDeque<Instant>,
    last_delivered: u64,
}

impl Client {
    fn wants(&self, topic: &str) -> bool {
        self.globs.iter().any(|glob| glob.matches(topic))
    }

    fn note_drop(&mut self, event: &BusEvent, now: Instant, window: Duration) {
        match &mut self.run {
            Some(run) => {
                run.last = event.seq;
                run.count += 1;
            }
            None => {
                self.run = Some(DropRun {
                    topic: event.topic.clone(),
                    first: event.seq,
                    last: event.seq,
                    count: 1,
                })
            }
        }
        self.recent_drops.push_back(now);
        while self
            .recent_drops
            .front()
            .is_some_and(|at| now.duration_since(*at) > window)
        {
            self.recent_drops.pop_front();
        }
    }
}

struct DroppedRun {
    client: String,
    reason: DropReason,
    run: DropRun,
}

struct Shared {
    config: HubConfig,
    store: Arc<WsEventStore>,
    metrics: Option<Arc<ServerMetrics>>,
    clients: Mutex<HashMap<String, Client>>,
}

impl Shared {
    fn dispatch(&self, event: &BusEvent) {
        let encoded = event_frame(event);
        let now = Instant::now();
        let mut flushed = Vec::new();
        {
            let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
            let mut evicted = Vec::new();
            for (id, client) in clients.iter_mut() {
                if !client.wants(&event.topic) || event.seq <= client.last_delivered {
                    continue;
                }
                match client.tx.try_send(encoded.clone()) {
                    Ok(()) => {
                        client.last_delivered = event.seq;
                        if let Some(run) = client.run.take() {
                            flushed.push(DroppedRun {
                                client: id.clone(),
                                reason: DropReason::BufferFull,
                                run,
                            });
                        }
                    }
                    Err(TrySendError::Full(_)) => {
                        client.note_drop(event, now, self.config.drop_window);
                        if client.recent_drops.len() > self.config.drop_threshold {
                            warn!(client = %id, user = %client.identity.user_id, "disconnecting slow websocket client");
                            evicted.push((id.clone(), DropReason::BufferFull));
                        }
                    }
                    Err(TrySendError::Closed(_)) => {
                        client.note_drop(event, now, self.config.drop_window);
                        evicted.push((id.clone(), DropReason::ClientClosed));
                    }
                }
            }
            for (id, reason) in evicted {
                if let Some(client) = clients.remove(&id) {
                    if let Some(run) = client.run {
                        flushed.push(DroppedRun {
                            client: id,
                            reason,
                            run,
                        });
                    }
                }
            }
        }
        for dropped in flushed {
            self.record(dropped);
        }
    }

    fn record(&self, dropped: DroppedRun) {
        let DroppedRun { client, reason, run } = dropped;
        self.store
            .record_dropped(&client, &run.topic, reason, run.first, run.last, run.count);
        if let Some(metrics) = &self.metrics {
            metrics.record_dropped(reason.as_str(), run.count);
        }
    }
}

/// A registered connection. Replies go through `tx`; the socket writer
/// drains `rx`. The hub closes `rx` by dropping its sender on eviction.
pub struct ClientSession {
    pub id: String,
    pub tx: mpsc::Sender<Frame>,
    pub rx: mpsc::Receiver<Frame>,
}

/// WebSocket fan-out. A single broadcaster task serialises each event once
/// and offers it to every matching client without blocking.
pub struct WsHub {
    shared: Arc<Shared>,
    inbox: mpsc::Sender<BusEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl WsHub {
    pub fn start(config: HubConfig, store: Arc<WsEventStore>, metrics: Option<Arc<ServerMetrics>>) -> Arc<Self> {
        let (inbox, mut rx) = mpsc::channel::<BusEvent>(config.inbox_capacity.max(1));
        let shared = Arc::new(Shared {
            config,
            store,
            metrics,
            clients: Mutex::new(HashMap::new()),
        });
        let worker_shared = shared.clone();
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                worker_shared.dispatch(&event);
            }
            debug!("websocket broadcaster stopped");
        });
        Arc::new(Self {
            shared,
            inbox,
            worker: Mutex::new(Some(worker)),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<WsEventStore> {
        &self.shared.store
    }

    pub fn register(&self, identity: Identity, origin: Option<String>) -> ClientSession {
        let id = format!("ws-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.shared.config.client_buffer.max(1));
        info!(client = %id, user = %identity.user_id, "websocket client connected");
        self.shared
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id.clone(),
                Client {
                    identity,
                    origin,
                    globs: Vec::new(),
                    tx: tx.clone(),
                    run: None,
                    recent_drops: VecDeque::new(),
                    last_delivered: 0,
                },
            );
        ClientSession { id, tx, rx }
    }

    /// Adds topics to a client's subscription and returns the full set.
    pub fn subscribe(&self, client_id: &str, topics: &[String]) -> Result<Vec<TopicGlob>, String> {
        let mut clients = self
            .shared
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let client = clients
            .get_mut(client_id)
            .ok_or_else(|| "client is not connected".to_string())?;
        for glob in authorize_topics(&client.identity, topics)? {
            if !client.globs.contains(&glob) {
                client.globs.push(glob);
            }
        }
        Ok(client.globs.clone())
    }

    pub fn unsubscribe(&self, client_id: &str, topics: &[String]) -> Result<Vec<TopicGlob>, String> {
        let removed = topics
            .iter()
            .map(|topic| topic.parse::<TopicGlob>())
            .collect::<Result<Vec<_>, _>>()?;
        let mut clients = self
            .shared
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let client = clients
            .get_mut(client_id)
            .ok_or_else(|| "client is not connected".to_string())?;
        client.globs.retain(|glob| !removed.contains(glob));
        Ok(client.globs.clone())
    }

    pub fn mark_delivered(&self, client_id: &str, seq: u64) {
        if let Some(client) = self
            .shared
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(client_id)
        {
            client.last_delivered = client.last_delivered.max(seq);
        }
    }

    pub fn unregister(&self, client_id: &str) {
        let removed = self
            .shared
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(client_id);
        if let Some(client) = removed {
            info!(client = %client_id, origin = ?client.origin, "websocket client disconnected");
            if let Some(run) = client.run {
                self.shared.record(DroppedRun {
                    client: client_id.to_string(),
                    reason: DropReason::ClientClosed,
                    run,
                });
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.shared
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stops the broadcaster and drops every client channel.
    pub fn close(&self) {
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            worker.abort();
        }
        let clients: Vec<_> = self
            .shared
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if !clients.is_empty() {
            info!(clients = clients.len(), "closed websocket clients");
        }
    }

    #[cfg(test)]
    fn dispatch_now(&self, event: &BusEvent) {
        self.shared.dispatch(event);
    }
}

impl EventSink for WsHub {
    fn name(&self) -> &'static str {
        "ws-hub"
    }

    fn deliver(&self, event: &BusEvent) {
        match self.inbox.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.shared.record(DroppedRun {
                    client: HUB_CLIENT_ID.to_string(),
                    reason: DropReason::HubOverflow,
                    run: DropRun {
                        topic: event.topic,
                        first: event.seq,
                        last: event.seq,
                        count: 1,
                    },
                });
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::events::EventStoreConfig;
    use crate::domain::rbac::Role;

    fn store() -> Arc<WsEventStore> {
        Arc::new(WsEventStore::memory(EventStoreConfig::default()))
    }

    fn viewer() -> Identity {
        Identity::new("vera", Role::Viewer, AuthMode::ApiKey)
    }

    #[test]
    fn star_expands_for_non_admins() {
        let granted = authorize_topics(&viewer(), &["*".into()]).unwrap();
        assert!(!granted.contains(&TopicGlob::All));
        assert!(granted.contains(&TopicGlob::Prefix("sessions".into())));
        assert!(granted.contains(&TopicGlob::Exact("approvals".into())));

        let admin = Identity::local_admin();
        assert_eq!(authorize_topics(&admin, &["*".into()]).unwrap(), vec![TopicGlob::All]);
    }

    #[test]
    fn topics_outside_permissions_are_rejected() {
        let nobody = Identity::new("x", Role::parse("ghost"), AuthMode::ApiKey);
        assert!(authorize_topics(&nobody, &["sessions:foo".into()]).is_err());
        assert!(authorize_topics(&viewer(), &["unknown:thing".into()]).is_err());
        assert_eq!(
            authorize_topics(&viewer(), &["panes:foo:1".into(), "panes:foo:1".into()]).unwrap(),
            vec![TopicGlob::Exact("panes:foo:1".into())]
        );
        assert!(authorize_topics(&viewer(), &[]).is_err());
    }

    #[test]
    fn origin_policy() {
        let allowed = vec!["https://dash.example.com".to_string()];
        assert!(origin_allowed(None, &allowed, AuthMode::ApiKey));
        assert!(origin_allowed(Some("https://dash.example.com"), &allowed, AuthMode::Oidc));
        assert!(!origin_allowed(Some("https://evil.example.com"), &allowed, AuthMode::ApiKey));
        assert!(!origin_allowed(Some("http://localhost:3000"), &allowed, AuthMode::ApiKey));
        assert!(origin_allowed(Some("http://localhost:3000"), &[], AuthMode::Local));
        assert!(origin_allowed(Some("http://[::1]:8080"), &[], AuthMode::Local));
        assert!(!origin_allowed(Some("http://192.168.0.2"), &[], AuthMode::Local));
    }

    #[test]
    fn frames_carry_type_and_seq() {
        let text = frame("ack", 7, json!({"request_id": "r1"}));
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["seq"], 7);
        assert_eq!(value["request_id"], "r1");
    }

    #[tokio::test]
    async fn delivers_only_matching_topics() {
        let store = store();
        let hub = WsHub::start(HubConfig::default(), store.clone(), None);
        let mut session = hub.register(Identity::local_admin(), None);
        hub.subscribe(&session.id, &["sessions:foo".into()]).unwrap();

        hub.dispatch_now(&store.store("sessions:bar", "session.created", json!({})));
        hub.dispatch_now(&store.store("sessions:foo", "session.created", json!({"n": 1})));

        let text = session.rx.try_recv().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["topic"], "sessions:foo");
        assert_eq!(value["seq"], 2);
        assert!(session.rx.try_recv().is_err());
        hub.close();
    }

    #[tokio::test]
    async fn drops_are_coalesced_then_client_is_evicted() {
        let store = store();
        let config = HubConfig {
            client_buffer: 1,
            drop_threshold: 3,
            ..HubConfig::default()
        };
        let hub = WsHub::start(config, store.clone(), None);
        let mut session = hub.register(Identity::local_admin(), None);
        hub.subscribe(&session.id, &["*".into()]).unwrap();

        hub.dispatch_now(&store.store("system", "tick", json!({})));
        hub.dispatch_now(&store.store("system", "tick", json!({})));
        hub.dispatch_now(&store.store("system", "tick", json!({})));
        session.rx.try_recv().unwrap();
        hub.dispatch_now(&store.store("system", "tick", json!({})));

        let dropped = store.dropped(10).unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!((dropped[0].first_seq, dropped[0].last_seq, dropped[0].count), (2, 3, 2));
        assert_eq!(dropped[0].reason, DropReason::BufferFull);

        for _ in 0..5 {
            hub.dispatch_now(&store.store("system", "tick", json!({})));
        }
        assert_eq!(hub.client_count(), 0);
        hub.close();
    }

    #[tokio::test]
    async fn unsubscribe_removes_globs() {
        let hub = WsHub::start(HubConfig::default(), store(), None);
        let session = hub.register(Identity::local_admin(), Some("http://localhost".into()));
        hub.subscribe(&session.id, &["jobs".into(), "jobs:*".into()]).unwrap();
        let remaining = hub.unsubscribe(&session.id, &["jobs".into()]).unwrap();
        assert_eq!(remaining, vec![TopicGlob::Prefix("jobs".into())]);
        hub.unregister(&session.id);
        assert!(hub.subscribe(&session.id, &["jobs".into()]).is_err());
        hub.close();
    }
}
