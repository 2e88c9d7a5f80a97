//! Memory, beads, cass, accounts, the scanner and agent mail. Each is an
//! external tool (or the mail server); a missing one surfaces as 503
//! `DEPENDENCY_MISSING`.

use super::{require_text, split_list, validate_name};
use crate::api::auth::force_release_gate;
use crate::api::context::RequestContext;
use crate::api::envelope::{ok, ApiError, ApiResult};
use crate::api::extract::{ApiJson, ApiPath, ApiQuery, JsonOrDefault};
use crate::app::accounts::{RotateRequest, RotationRecord};
use crate::app::integrations::{DaemonStatus, ScanRecord, ScanRequest};
use crate::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const BEADS_TIMEOUT: Duration = Duration::from_secs(30);
const CASS_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SEARCH_LIMIT: usize = 20;
const MAX_SEARCH_LIMIT: usize = 200;
const DEFAULT_INBOX_LIMIT: usize = 20;

#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    #[serde(default)]
    pub task: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    #[serde(default)]
    pub session: String,
}

#[derive(Debug, Deserialize)]
pub struct BeadCreate {
    pub title: String,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BeadClose {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct InboxQuery {
    #[serde(default)]
    pub project_key: String,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub urgent_only: bool,
}

#[derive(Debug, Deserialize)]
pub struct MailSend {
    pub project_key: String,
    pub sender_name: String,
    /// Recipients, as a list or a comma separated string.
    #[serde(deserialize_with = "recipients")]
    pub to: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub body_md: String,
    #[serde(default)]
    pub importance: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReservationQuery {
    #[serde(default)]
    pub project_key: String,
    #[serde(default)]
    pub agent_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Reservation {
    pub project_key: String,
    pub agent_name: String,
    pub paths: Vec<String>,
    #[serde(default = "default_reservation_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_exclusive")]
    pub exclusive: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReleaseQuery {
    #[serde(default)]
    pub project_key: String,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub force: bool,
}

fn default_reservation_ttl() -> u64 {
    3600
}

fn default_exclusive() -> bool {
    true
}

fn recipients<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Joined(String),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::List(list) => list
            .into_iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect(),
        Raw::Joined(joined) => split_list(Some(&joined)),
    })
}

/// Bead ids look like `bd-12` or `ntm-a3f`.
fn bead_id(id: &str) -> Result<&str, ApiError> {
    validate_name("id", id)
}

// memory

pub async fn memory_context(State(state): State<AppState>, ApiQuery(query): ApiQuery<TaskQuery>) -> ApiResult<Value> {
    let task = require_text("task", &query.task)?;
    ok(state.memory.context(task).await?)
}

pub async fn memory_daemon(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<SessionQuery>,
) -> ApiResult<DaemonStatus> {
    let session = validate_name("session", &query.session)?;
    ok(state.memory.daemon(session).await?)
}

// beads

pub async fn beads_list(State(state): State<AppState>) -> ApiResult<Value> {
    ok(state.tools.run_json("beads", ["list", "--json"], BEADS_TIMEOUT).await?)
}

pub async fn beads_ready(State(state): State<AppState>) -> ApiResult<Value> {
    ok(state.tools.run_json("beads", ["ready", "--json"], BEADS_TIMEOUT).await?)
}

pub async fn beads_get(State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> ApiResult<Value> {
    let id = bead_id(&id)?;
    ok(state
        .tools
        .run_json("beads", ["show", id, "--json"], BEADS_TIMEOUT)
        .await?)
}

pub async fn beads_create(State(state): State<AppState>, ApiJson(body): ApiJson<BeadCreate>) -> ApiResult<Value> {
    let title = require_text("title", &body.title)?;
    if matches!(body.priority, Some(priority) if priority > 4) {
        return Err(ApiError::invalid_field("priority", "priority must be between 0 and 4"));
    }
    let mut args = vec!["create".to_string(), title.to_string()];
    if let Some(priority) = body.priority {
        args.push("--priority".into());
        args.push(priority.to_string());
    }
    if let Some(description) = body.description.filter(|d| !d.trim().is_empty()) {
        args.push("--description".into());
        args.push(description);
    }
    args.push("--json".into());
    ok(state.tools.run_json("beads", args, BEADS_TIMEOUT).await?)
}

pub async fn beads_close(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
    JsonOrDefault(body): JsonOrDefault<BeadClose>,
) -> ApiResult<Value> {
    let id = bead_id(&id)?;
    let mut args = vec!["close".to_string(), id.to_string()];
    if let Some(reason) = body.reason.filter(|r| !r.trim().is_empty()) {
        args.push("--reason".into());
        args.push(reason);
    }
    args.push("--json".into());
    ok(state.tools.run_json("beads", args, BEADS_TIMEOUT).await?)
}

// cass

pub async fn cass_search(State(state): State<AppState>, ApiQuery(query): ApiQuery<SearchQuery>) -> ApiResult<Value> {
    let q = require_text("q", &query.q)?;
    let limit = query
        .limit
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .min(MAX_SEARCH_LIMIT);
    ok(state
        .tools
        .run_json(
            "cass",
            ["search".to_string(), q.to_string(), "--json".into(), "--limit".into(), limit.to_string()],
            CASS_TIMEOUT,
        )
        .await?)
}

pub async fn cass_status(State(state): State<AppState>) -> ApiResult<Value> {
    ok(state.tools.run_json("cass", ["status", "--json"], CASS_TIMEOUT).await?)
}

// accounts

pub async fn accounts_list(State(state): State<AppState>) -> ApiResult<Value> {
    ok(state.accounts.list().await?)
}

pub async fn accounts_status(State(state): State<AppState>) -> ApiResult<Value> {
    ok(state.accounts.status().await?)
}

pub async fn accounts_rotate(
    State(state): State<AppState>,
    ctx: RequestContext,
    JsonOrDefault(body): JsonOrDefault<RotateRequest>,
) -> ApiResult<Value> {
    let (result, rotation) = state.accounts.rotate(body, &ctx.identity.user_id).await?;
    ok(json!({ "result": result, "rotation": rotation }))
}

pub async fn accounts_history(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<HistoryQuery>,
) -> ApiResult<Value> {
    let rotations: Vec<RotationRecord> = state.accounts.history(query.limit);
    ok(json!({ "count": rotations.len(), "rotations": rotations }))
}

// scanner

pub async fn scanner_run(
    State(state): State<AppState>,
    ctx: RequestContext,
    JsonOrDefault(body): JsonOrDefault<ScanRequest>,
) -> ApiResult<ScanRecord> {
    if body.path.as_deref().is_some_and(|path| path.split('/').any(|part| part == "..")) {
        return Err(ApiError::invalid_field("path", "path must not contain '..'"));
    }
    ok(state.scanner.run(body, &ctx.identity.user_id).await?)
}

pub async fn scanner_status(State(state): State<AppState>) -> ApiResult<Value> {
    ok(state.scanner.status())
}

// mail

pub async fn mail_inbox(State(state): State<AppState>, ApiQuery(query): ApiQuery<InboxQuery>) -> ApiResult<Value> {
    let project_key = require_text("project_key", &query.project_key)?;
    let agent_name = validate_name("agent_name", &query.agent_name)?;
    ok(state
        .mail
        .call_tool(
            "fetch_inbox",
            json!({
                "project_key": project_key,
                "agent_name": agent_name,
                "limit": query.limit.filter(|limit| *limit > 0).unwrap_or(DEFAULT_INBOX_LIMIT),
                "urgent_only": query.urgent_only,
                "include_bodies": true,
            }),
        )
        .await?)
}

pub async fn mail_send(State(state): State<AppState>, ApiJson(body): ApiJson<MailSend>) -> ApiResult<Value> {
    let project_key = require_text("project_key", &body.project_key)?;
    let sender = validate_name("sender_name", &body.sender_name)?;
    let subject = require_text("subject", &body.subject)?;
    if body.to.is_empty() {
        return Err(ApiError::invalid_field("to", "at least one recipient is required"));
    }
    for recipient in &body.to {
        validate_name("to", recipient)?;
    }
    ok(state
        .mail
        .call_tool(
            "send_message",
            json!({
                "project_key": project_key,
                "sender_name": sender,
                "to": body.to,
                "subject": subject,
                "body_md": body.body_md,
                "importance": body.importance.unwrap_or_else(|| "normal".into()),
                "thread_id": body.thread_id,
            }),
        )
        .await?)
}

pub async fn mail_reservations(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ReservationQuery>,
) -> ApiResult<Value> {
    let project_key = require_text("project_key", &query.project_key)?;
    let agent_name = query
        .agent_name
        .as_deref()
        .filter(|name| !name.is_empty())
        .map(|name| validate_name("agent_name", name))
        .transpose()?;
    ok(state
        .mail
        .call_tool(
            "list_file_reservations",
            json!({ "project_key": project_key, "agent_name": agent_name }),
        )
        .await?)
}

pub async fn mail_reserve(State(state): State<AppState>, ApiJson(body): ApiJson<Reservation>) -> ApiResult<Value> {
    let project_key = require_text("project_key", &body.project_key)?;
    let agent_name = validate_name("agent_name", &body.agent_name)?;
    let paths: Vec<&str> = body.paths.iter().map(|p| p.trim()).filter(|p| !p.is_empty()).collect();
    if paths.is_empty() {
        return Err(ApiError::invalid_field("paths", "at least one path is required"));
    }
    if body.ttl_seconds < 60 {
        return Err(ApiError::invalid_field("ttl_seconds", "ttl_seconds must be at least 60"));
    }
    ok(state
        .mail
        .call_tool(
            "file_reservation_paths",
            json!({
                "project_key": project_key,
                "agent_name": agent_name,
                "paths": paths,
                "ttl_seconds": body.ttl_seconds,
                "exclusive": body.exclusive,
                "reason": body.reason.unwrap_or_default(),
            }),
        )
        .await?)
}

pub async fn mail_release(
    State(state): State<AppState>,
    ctx: RequestContext,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
    ApiQuery(query): ApiQuery<ReleaseQuery>,
) -> ApiResult<Value> {
    let reservation: u64 = id
        .trim()
        .parse()
        .map_err(|_| ApiError::invalid_field("id", "reservation id must be a number"))?;
    let project_key = require_text("project_key", &query.project_key)?;
    let agent_name = validate_name("agent_name", &query.agent_name)?;

    if query.force {
        force_release_gate(&state, &ctx, &headers, &format!("reservation:{reservation}"))?;
        return ok(state
            .mail
            .call_tool(
                "force_release_file_reservation",
                json!({
                    "project_key": project_key,
                    "agent_name": agent_name,
                    "file_reservation_id": reservation,
                    "notify_previous": true,
                }),
            )
            .await?);
    }
    ok(state
        .mail
        .call_tool(
            "release_file_reservations",
            json!({
                "project_key": project_key,
                "agent_name": agent_name,
                "file_reservation_ids": [reservation],
            }),
        )
        .await?)
}
