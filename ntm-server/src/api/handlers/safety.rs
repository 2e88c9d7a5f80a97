//! Wrapper installation, the block log, redaction summaries and the policy
//! document.

use super::require_text;
use crate::api::auth::approval_gate;
use crate::api::context::RequestContext;
use crate::api::envelope::{ok, ApiResult};
use crate::api::extract::{ApiJson, ApiQuery, JsonOrDefault};
use crate::app::safety::policy_store::{DEFAULT_BLOCKED_HOURS, DEFAULT_BLOCKED_LIMIT};
use crate::app::safety::{InstallReport, PolicyView, SafetyStatus, UninstallReport};
use crate::domain::events::topics;
use crate::domain::policy::{self, Automation, PolicyDecision, ValidationReport};
use crate::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Default, Deserialize)]
pub struct BlockedQuery {
    #[serde(default)]
    pub hours: Option<i64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CommandCheck {
    pub command: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct InstallRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PolicyContent {
    pub content: String,
}

pub async fn status(State(state): State<AppState>) -> ApiResult<SafetyStatus> {
    ok(state.installer.status().await?)
}

pub async fn blocked(State(state): State<AppState>, ApiQuery(query): ApiQuery<BlockedQuery>) -> ApiResult<Value> {
    let hours = query.hours.filter(|hours| *hours > 0).unwrap_or(DEFAULT_BLOCKED_HOURS);
    let limit = query
        .limit
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_BLOCKED_LIMIT)
        .min(1000);
    let entries = state.policy.blocked(hours, limit).await?;
    ok(json!({ "hours": hours, "count": entries.len(), "entries": entries }))
}

pub async fn check(State(state): State<AppState>, ApiJson(body): ApiJson<CommandCheck>) -> ApiResult<PolicyDecision> {
    let command = require_text("command", &body.command)?;
    ok(state.policy.check(command))
}

pub async fn install(
    State(state): State<AppState>,
    ctx: RequestContext,
    JsonOrDefault(body): JsonOrDefault<InstallRequest>,
) -> ApiResult<InstallReport> {
    let report = state.installer.install(body.force).await?;
    state.bus.publish(
        topics::SAFETY,
        "safety.installed",
        json!({ "installed": report.installed, "policy_created": report.policy_created, "by": ctx.identity.user_id }),
    );
    ok(report)
}

pub async fn uninstall(
    State(state): State<AppState>,
    ctx: RequestContext,
    headers: HeaderMap,
) -> ApiResult<UninstallReport> {
    approval_gate(&state, &ctx, &headers, "safety.uninstall", "safety")?;
    let report = state.installer.uninstall().await?;
    state.bus.publish(
        topics::SAFETY,
        "safety.uninstalled",
        json!({ "removed": report.removed, "skipped": report.skipped, "by": ctx.identity.user_id }),
    );
    ok(report)
}

pub async fn redaction(State(state): State<AppState>, ApiQuery(query): ApiQuery<LimitQuery>) -> ApiResult<Value> {
    let summaries = state.summaries.recent(query.limit.unwrap_or(100).min(1000));
    ok(json!({
        "mode": state.redactor.mode().as_str(),
        "count": summaries.len(),
        "summaries": summaries,
        "totals": state.summaries.totals(),
    }))
}

pub async fn policy_get(State(state): State<AppState>) -> ApiResult<PolicyView> {
    ok(state.policy.view().await?)
}

pub async fn policy_update(
    State(state): State<AppState>,
    ctx: RequestContext,
    ApiJson(body): ApiJson<PolicyContent>,
) -> ApiResult<PolicyView> {
    let view = state.policy.update(&body.content).await?;
    publish_policy(&state, &ctx, "update", &view);
    ok(view)
}

pub async fn policy_validate(ApiJson(body): ApiJson<PolicyContent>) -> ApiResult<ValidationReport> {
    ok(policy::validate(&body.content))
}

pub async fn policy_reset(
    State(state): State<AppState>,
    ctx: RequestContext,
    headers: HeaderMap,
) -> ApiResult<PolicyView> {
    approval_gate(&state, &ctx, &headers, "policy.reset", "policy")?;
    let view = state.policy.reset().await?;
    publish_policy(&state, &ctx, "reset", &view);
    ok(view)
}

pub async fn automation_get(State(state): State<AppState>) -> ApiResult<Automation> {
    ok(state.policy.automation())
}

pub async fn automation_update(
    State(state): State<AppState>,
    ctx: RequestContext,
    ApiJson(body): ApiJson<Automation>,
) -> ApiResult<Automation> {
    let automation = state.policy.update_automation(body).await?;
    state.bus.publish(
        topics::SAFETY,
        "policy.updated",
        json!({ "change": "automation", "automation": automation, "by": ctx.identity.user_id }),
    );
    ok(automation)
}

fn publish_policy(state: &AppState, ctx: &RequestContext, change: &str, view: &PolicyView) {
    state.bus.publish(
        topics::SAFETY,
        "policy.updated",
        json!({ "change": change, "source": view.source, "stats": view.stats, "by": ctx.identity.user_id }),
    );
}
