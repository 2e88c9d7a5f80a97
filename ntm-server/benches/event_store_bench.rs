use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ntm_server::app::events::{EventStoreConfig, WsEventStore};
use ntm_server::app::redaction::{RedactionConfig, Redactor};
use ntm_server::domain::events::TopicGlob;
use ntm_server::domain::policy::{SafetyPolicy, DEFAULT_POLICY_YAML};
use serde_json::json;

fn filled_store(buffer_size: usize, events: u64) -> WsEventStore {
    let store = WsEventStore::memory(EventStoreConfig {
        buffer_size,
        ..EventStoreConfig::default()
    });
    for seq in 0..events {
        let topic = if seq % 3 == 0 { "approvals" } else { "sessions:proj" };
        store.store(topic, "bench", json!({ "n": seq }));
    }
    store
}

fn event_store_append(c: &mut Criterion) {
    let store = filled_store(1024, 0);
    c.bench_function("event_store_append", |b| {
        b.iter(|| store.store(black_box("sessions:proj"), "pane.output", json!({ "line": "ok" })))
    });
}

fn event_store_replay_from_ring(c: &mut Criterion) {
    let store = filled_store(1024, 1024);
    let all = TopicGlob::All;
    let sessions: TopicGlob = "sessions:*".parse().unwrap();

    c.bench_function("event_store_replay_all", |b| {
        b.iter(|| store.get_since(black_box(512), &all, 0).unwrap())
    });
    c.bench_function("event_store_replay_filtered", |b| {
        b.iter(|| store.get_since(black_box(512), &sessions, 0).unwrap())
    });
}

fn policy_check(c: &mut Criterion) {
    let policy = SafetyPolicy::from_yaml(DEFAULT_POLICY_YAML)
        .unwrap()
        .compile()
        .unwrap();

    c.bench_function("policy_check_blocked", |b| {
        b.iter(|| policy.check(black_box("git push --force origin main")))
    });
    c.bench_function("policy_check_allowed", |b| {
        b.iter(|| policy.check(black_box("cargo test --workspace")))
    });
}

fn redaction_scan(c: &mut Criterion) {
    let redactor = Redactor::new(RedactionConfig::default());
    let clean = "building 42 crates, 0 warnings, all tests passed ".repeat(20);
    let dirty = format!("{clean} export OPENAI_API_KEY=sk-proj-abcdefghijklmnopqrstuvwxyz0123456789");

    c.bench_function("redaction_scan_clean", |b| {
        b.iter(|| redactor.scan_str(black_box(&clean), true))
    });
    c.bench_function("redaction_scan_secret", |b| {
        b.iter(|| redactor.scan_str(black_box(&dirty), true))
    });
}

criterion_group!(
    benches,
    event_store_append,
    event_store_replay_from_ring,
    policy_check,
    redaction_scan
);
criterion_main!(benches);
