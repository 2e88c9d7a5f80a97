use crate::api::context::RequestContext;
use crate::api::envelope::{ok, ApiError, ApiResult};
use crate::api::extract::ApiQuery;
use crate::api::ws::replay;
use crate::app::events::DEFAULT_REPLAY_LIMIT;
use crate::app::hub::authorize_topics;
use crate::domain::audit::AuditFilter;
use crate::AppState;
use axum::extract::State;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Default, Deserialize)]
pub struct ReplayQuery {
    #[serde(default)]
    pub since_seq: u64,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// The effective configuration, without secrets.
pub async fn config(State(state): State<AppState>) -> ApiResult<Value> {
    let settings = &state.settings;
    let events = state.bus.store().config();
    let hub = state.hub.config();
    ok(json!({
        "listen": settings.listen.to_string(),
        "data_dir": settings.data_dir,
        "db_path": settings.db_path(),
        "home": state.paths.home(),
        "cors_origins": settings.cors_origins,
        "auth": {
            "mode": settings.auth.mode.as_str(),
            "api_keys": settings.auth.api_keys.len(),
            "oidc_issuer": settings.auth.oidc.as_ref().map(|oidc| oidc.issuer.clone()),
        },
        "events": {
            "buffer_size": events.buffer_size,
            "retention_secs": events.retention.as_secs(),
            "cleanup_interval_secs": events.cleanup_interval.as_secs(),
            "persistent": state.bus.store().is_persistent(),
        },
        "hub": {
            "client_buffer": hub.client_buffer,
            "ping_interval_secs": hub.ping_interval.as_secs(),
            "pong_timeout_secs": hub.pong_timeout.as_secs(),
        },
        "audit": {
            "path": state.audit.path(),
            "indexed": state.audit.has_index(),
            "retention_days": settings.audit_retention().as_secs() / 86_400,
        },
        "idempotency": {
            "ttl_secs": state.idempotency.ttl().as_secs(),
            "capacity": settings.idempotency_capacity,
        },
        "approval_ttl_secs": settings.approval_ttl.as_secs(),
        "kernel_timeout_secs": settings.kernel_timeout.as_secs(),
        "redaction": {
            "mode": state.redactor.mode().as_str(),
            "max_body_bytes": state.redactor.config().max_body_bytes,
        },
        "features": {
            "ws": settings.features.ws,
            "sse": settings.features.sse,
            "openapi": settings.features.openapi,
            "persist": settings.features.persist,
        },
        "agent_mail": state.mail.is_configured(),
        "otlp": settings.otlp_endpoint.is_some(),
    }))
}

pub async fn deps(State(state): State<AppState>) -> ApiResult<Value> {
    let tools = state.tools.report();
    let installed = tools.iter().filter(|tool| tool.installed).count();
    ok(json!({ "installed": installed, "count": tools.len(), "tools": tools }))
}

pub async fn deps_refresh(State(state): State<AppState>) -> ApiResult<Value> {
    let registry = state.tools.clone();
    let tools = tokio::task::spawn_blocking(move || registry.refresh())
        .await
        .map_err(|err| ApiError::internal(format!("tool lookup failed: {err}")))?;
    let installed = tools.iter().filter(|tool| tool.installed).count();
    ok(json!({ "installed": installed, "count": tools.len(), "tools": tools }))
}

pub async fn health(State(state): State<AppState>) -> ApiResult<Value> {
    let uptime = Utc::now() - state.started_at;
    ok(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": state.started_at,
        "uptime_secs": uptime.num_seconds().max(0),
        "components": {
            "event_store": {
                "persistent": state.bus.store().is_persistent(),
                "seq": state.bus.current_seq(),
            },
            "audit": {
                "indexed": state.audit.has_index(),
            },
            "kernel": { "available": state.tools.is_installed("ntm") },
            "ws_clients": state.hub.client_count(),
            "sse_clients": state.sse.client_count(),
            "jobs": state.jobs.list(None).len(),
            "streams": state.streams.list().len(),
        },
    }))
}

pub async fn audit(State(state): State<AppState>, ApiQuery(filter): ApiQuery<AuditFilter>) -> ApiResult<Value> {
    let store = state.audit.clone();
    let limit = filter.effective_limit();
    let records = tokio::task::spawn_blocking(move || store.query(&filter))
        .await
        .map_err(|err| ApiError::internal(format!("audit query failed: {err}")))??;
    ok(json!({ "count": records.len(), "limit": limit, "records": records }))
}

pub async fn events_replay(
    State(state): State<AppState>,
    ctx: RequestContext,
    ApiQuery(query): ApiQuery<ReplayQuery>,
) -> ApiResult<Value> {
    let topic = query.topic.unwrap_or_else(|| "*".into());
    let globs = authorize_topics(&ctx.identity, &[topic]).map_err(ApiError::forbidden)?;
    let (mut events, reset) = replay(&state, &globs, query.since_seq)?;
    events.truncate(query.limit.filter(|limit| *limit > 0).unwrap_or(DEFAULT_REPLAY_LIMIT));
    ok(json!({
        "since_seq": query.since_seq,
        "current_seq": state.bus.current_seq(),
        "reset": reset,
        "count": events.len(),
        "events": events,
    }))
}

pub async fn events_dropped(State(state): State<AppState>, ApiQuery(query): ApiQuery<LimitQuery>) -> ApiResult<Value> {
    let dropped = state
        .bus
        .store()
        .dropped(query.limit.filter(|limit| *limit > 0).unwrap_or(100).min(1000))?;
    ok(json!({ "count": dropped.len(), "dropped": dropped }))
}
