use super::{require_text, validate_name};
use crate::api::context::RequestContext;
use crate::api::envelope::{ok, ApiError, ApiResult};
use crate::api::extract::{ApiJson, ApiPath, ApiQuery, JsonOrDefault};
use crate::app::approvals::NewApproval;
use crate::domain::approvals::{Approval, ApprovalStatus};
use crate::AppState;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const DEFAULT_HISTORY: usize = 50;
const MAX_HISTORY: usize = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalRequest {
    pub action: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApprovalDecision {
    #[serde(default)]
    pub reason: Option<String>,
}

/// The approval plus the decision just taken on it.
#[derive(Debug, Serialize)]
pub struct Decided {
    #[serde(flatten)]
    pub approval: Approval,
    pub decision: &'static str,
}

pub async fn list(State(state): State<AppState>, ApiQuery(query): ApiQuery<ListQuery>) -> ApiResult<Value> {
    let status = query
        .status
        .as_deref()
        .filter(|status| !status.is_empty())
        .map(str::parse::<ApprovalStatus>)
        .transpose()
        .map_err(|err| ApiError::invalid_field("status", err))?;
    let approvals = state.approvals.list(status);
    ok(json!({ "count": approvals.len(), "approvals": approvals }))
}

pub async fn history(State(state): State<AppState>, ApiQuery(query): ApiQuery<HistoryQuery>) -> ApiResult<Value> {
    let limit = query
        .limit
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_HISTORY)
        .min(MAX_HISTORY);
    let approvals = state.approvals.history(limit);
    ok(json!({ "count": approvals.len(), "approvals": approvals }))
}

pub async fn get(State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> ApiResult<Approval> {
    let id = validate_name("id", &id)?;
    ok(state.approvals.get(id)?)
}

pub async fn request(
    State(state): State<AppState>,
    ctx: RequestContext,
    ApiJson(body): ApiJson<ApprovalRequest>,
) -> ApiResult<Approval> {
    let action = require_text("action", &body.action)?;
    ok(state.approvals.request(NewApproval {
        action: action.to_string(),
        resource: body.resource,
        reason: body.reason,
        requestor: ctx.identity.user_id,
    })?)
}

pub async fn approve(
    State(state): State<AppState>,
    ctx: RequestContext,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<Decided> {
    let id = validate_name("id", &id)?;
    let approval = state.approvals.approve(id, &ctx.identity.user_id)?;
    ok(Decided {
        approval,
        decision: "approved",
    })
}

pub async fn deny(
    State(state): State<AppState>,
    ctx: RequestContext,
    ApiPath(id): ApiPath<String>,
    JsonOrDefault(body): JsonOrDefault<ApprovalDecision>,
) -> ApiResult<Decided> {
    let id = validate_name("id", &id)?;
    let approval = state
        .approvals
        .deny(id, &ctx.identity.user_id, body.reason.filter(|reason| !reason.trim().is_empty()))?;
    ok(Decided {
        approval,
        decision: "denied",
    })
}
