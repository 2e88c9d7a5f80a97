use super::{kernel, kernel_with_timeout, require_text, split_list, validate_name};
use crate::api::envelope::{ok, ApiError, ApiResult};
use crate::api::extract::{ApiJson, ApiPath, ApiQuery, JsonOrDefault};
use crate::domain::events::topics;
use crate::AppState;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_WAIT: Duration = Duration::from_secs(300);
pub const MAX_WAIT: Duration = Duration::from_secs(3600);
const WAIT_GRACE: Duration = Duration::from_secs(5);
const CONDITIONS: &[&str] = &["idle", "complete", "generating", "healthy"];
const STRATEGIES: &[&str] = &["least-loaded", "round-robin", "random", "affinity"];

/// Which agents a command targets: a type, explicit panes, or all of them.
#[derive(Debug, Default, Deserialize)]
pub struct AgentTarget {
    #[serde(default, rename = "type")]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub panes: Option<Vec<u32>>,
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Deserialize)]
pub struct AgentSend {
    pub message: String,
    #[serde(flatten)]
    pub target: AgentTarget,
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitQuery {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub poll_ms: Option<u64>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub any: bool,
    #[serde(default)]
    pub exit_on_error: bool,
    #[serde(default)]
    pub require_transition: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct RouteQuery {
    #[serde(default, rename = "type")]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    /// Comma-separated pane indexes to skip.
    #[serde(default)]
    pub exclude: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContextQuery {
    #[serde(default)]
    pub lines: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AgentSpawn {
    pub agents: BTreeMap<String, u32>,
}

fn target_args(session: &str, target: &AgentTarget) -> Value {
    json!({
        "session": session,
        "type": target.agent_type,
        "panes": target.panes,
        "all": target.all,
    })
}

pub(crate) fn wait_timeout(requested: Option<u64>) -> Result<Duration, ApiError> {
    let timeout = requested.map(Duration::from_millis).unwrap_or(DEFAULT_WAIT);
    if timeout.is_zero() || timeout > MAX_WAIT {
        return Err(ApiError::invalid_field(
            "timeout_ms",
            format!("timeout_ms must be between 1 and {}", MAX_WAIT.as_millis()),
        ));
    }
    Ok(timeout)
}

pub async fn send(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
    ApiJson(body): ApiJson<AgentSend>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    let message = require_text("message", &body.message)?;
    let mut args = target_args(session, &body.target);
    args["message"] = json!(message);
    let result = kernel(&state, "agents.send", args).await?;
    state.bus.publish(
        &topics::session(session),
        "agent.prompted",
        json!({
            "session": session,
            "type": body.target.agent_type,
            "panes": body.target.panes,
            "length": message.len(),
        }),
    );
    ok(result)
}

pub async fn interrupt(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
    JsonOrDefault(target): JsonOrDefault<AgentTarget>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    ok(kernel(&state, "agents.interrupt", target_args(session, &target)).await?)
}

/// Blocks until the condition holds; the kernel call outlives the wait by a
/// small grace period so the kernel reports the timeout itself.
pub async fn wait(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
    ApiQuery(query): ApiQuery<WaitQuery>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    let timeout = wait_timeout(query.timeout_ms)?;
    let condition = query.condition.as_deref().unwrap_or("idle");
    if !CONDITIONS.contains(&condition) {
        return Err(ApiError::invalid_field(
            "condition",
            format!("condition must be one of {}", CONDITIONS.join(", ")),
        ));
    }
    let args = json!({
        "session": session,
        "timeout_ms": timeout.as_millis() as u64,
        "poll_ms": query.poll_ms,
        "condition": condition,
        "any": query.any,
        "exit_on_error": query.exit_on_error,
        "require_transition": query.require_transition,
    });
    ok(kernel_with_timeout(&state, "agents.wait", args, timeout + WAIT_GRACE).await?)
}

pub async fn route(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
    ApiQuery(query): ApiQuery<RouteQuery>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    let strategy = query.strategy.as_deref().unwrap_or("least-loaded");
    if !STRATEGIES.contains(&strategy) {
        return Err(ApiError::invalid_field(
            "strategy",
            format!("strategy must be one of {}", STRATEGIES.join(", ")),
        ));
    }
    let exclude = split_list(query.exclude.as_deref())
        .iter()
        .map(|pane| pane.parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ApiError::invalid_field("exclude", "exclude must list pane indexes"))?;
    ok(kernel(
        &state,
        "agents.route",
        json!({ "session": session, "type": query.agent_type, "strategy": strategy, "exclude": exclude }),
    )
    .await?)
}

pub async fn activity(State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    ok(kernel(&state, "agents.activity", json!({ "session": session })).await?)
}

pub async fn health(State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    ok(kernel(&state, "agents.health", json!({ "session": session })).await?)
}

pub async fn context(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
    ApiQuery(query): ApiQuery<ContextQuery>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    let lines = super::panes::output_lines(query.lines)?;
    ok(kernel(&state, "agents.context", json!({ "session": session, "lines": lines })).await?)
}

pub async fn restart(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
    JsonOrDefault(target): JsonOrDefault<AgentTarget>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    let result = kernel(&state, "agents.restart", target_args(session, &target)).await?;
    state.bus.publish(
        &topics::session(session),
        "agent.restarted",
        json!({ "session": session, "type": target.agent_type, "panes": target.panes }),
    );
    ok(result)
}

pub async fn spawn(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<String>,
    ApiJson(body): ApiJson<AgentSpawn>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    if body.agents.is_empty() || body.agents.values().all(|count| *count == 0) {
        return Err(ApiError::invalid_field("agents", "at least one agent is required"));
    }
    let result = kernel(
        &state,
        "agents.spawn",
        json!({ "session": session, "agents": body.agents }),
    )
    .await?;
    state.bus.publish(
        &topics::session(session),
        "agent.spawned",
        json!({ "session": session, "agents": body.agents }),
    );
    ok(result)
}
