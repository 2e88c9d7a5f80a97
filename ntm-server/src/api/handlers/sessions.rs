use super::{kernel, validate_name};
use crate::api::auth::approval_gate;
use crate::api::context::RequestContext;
use crate::api::envelope::{ok, ApiError, ApiResult};
use crate::api::extract::{ApiJson, ApiPath, ApiQuery, JsonOrDefault};
use crate::app::events::DEFAULT_REPLAY_LIMIT;
use crate::domain::events::{topics, TopicGlob};
use crate::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
pub struct SessionCreate {
    pub name: String,
    /// Agent type to count, e.g. `{"cc": 2, "cod": 1}`.
    #[serde(default)]
    pub agents: BTreeMap<String, u32>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub layout: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PaneRef {
    #[serde(default)]
    pub pane: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub since_seq: u64,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Value> {
    ok(kernel(&state, "sessions.list", json!({})).await?)
}

pub async fn create(State(state): State<AppState>, ApiJson(body): ApiJson<SessionCreate>) -> ApiResult<Value> {
    let name = validate_name("name", &body.name)?.to_string();
    if body.agents.values().any(|count| *count > 32) {
        return Err(ApiError::invalid_field("agents", "at most 32 agents of one type"));
    }
    let mut args = Map::new();
    args.insert("name".into(), json!(name));
    args.insert("agents".into(), json!(body.agents));
    if let Some(dir) = body.working_dir.filter(|dir| !dir.trim().is_empty()) {
        args.insert("working_dir".into(), json!(dir));
    }
    if let Some(layout) = body.layout {
        args.insert("layout".into(), json!(layout));
    }
    let created = kernel(&state, "sessions.create", Value::Object(args)).await?;
    state.bus.publish(
        &topics::session(&name),
        "session.created",
        json!({ "session": name, "agents": body.agents }),
    );
    ok(created)
}

pub async fn get(State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    ok(kernel(&state, "sessions.get", json!({ "session": session })).await?)
}

pub async fn kill(
    State(state): State<AppState>,
    ctx: RequestContext,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    let approval = approval_gate(&state, &ctx, &headers, "session.kill", session)?;
    let result = kernel(&state, "sessions.kill", json!({ "session": session })).await?;
    state.bus.publish(
        &topics::session(session),
        "session.killed",
        json!({ "session": session, "killed_by": ctx.identity.user_id, "approval_id": approval }),
    );
    ok(result)
}

pub async fn status(State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    ok(kernel(&state, "sessions.status", json!({ "session": session })).await?)
}

pub async fn attach(State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    ok(kernel(&state, "sessions.attach", json!({ "session": session })).await?)
}

pub async fn view(State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    ok(kernel(&state, "sessions.view", json!({ "session": session })).await?)
}

pub async fn zoom(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
    JsonOrDefault(body): JsonOrDefault<PaneRef>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    ok(kernel(&state, "sessions.zoom", json!({ "session": session, "pane": body.pane })).await?)
}

/// Stored events on `sessions:<id>`, for clients that missed them.
pub async fn events(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
    ApiQuery(query): ApiQuery<EventsQuery>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    let glob = TopicGlob::Exact(topics::session(session));
    let replay = state.bus.store().get_since(
        query.since_seq,
        &glob,
        query.limit.unwrap_or(DEFAULT_REPLAY_LIMIT).min(DEFAULT_REPLAY_LIMIT),
    )?;
    ok(json!({
        "session": session,
        "count": replay.events.len(),
        "events": replay.events,
        "reset": replay.reset,
        "current_seq": state.bus.current_seq(),
    }))
}

pub async fn agents(State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    ok(kernel(&state, "sessions.agents", json!({ "session": session })).await?)
}
