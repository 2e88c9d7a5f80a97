use super::{kernel, validate_name};
use crate::api::context::RequestContext;
use crate::api::envelope::{ok, ApiError, ApiResult, ErrorCode};
use crate::api::extract::{ApiJson, ApiPath, JsonOrDefault};
use crate::domain::events::topics;
use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Deserialize)]
pub struct PipelineExec {
    #[serde(default)]
    pub session: Option<String>,
    pub stages: Vec<Value>,
    #[serde(default)]
    pub vars: Map<String, Value>,
}

/// A workflow given inline (`workflow`, YAML) or by template name.
#[derive(Debug, Default, Deserialize)]
pub struct PipelineRun {
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub vars: Map<String, Value>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    /// Runs finished longer ago than this (e.g. `7d`) are removed.
    #[serde(default)]
    pub older_than: Option<String>,
}

fn invalid_workflow(message: impl Into<String>) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, ErrorCode::InvalidWorkflow, message)
}

fn run_args(body: &PipelineRun) -> Result<Value, ApiError> {
    let workflow = body.workflow.as_deref().filter(|w| !w.trim().is_empty());
    let template = body.template.as_deref().filter(|t| !t.trim().is_empty());
    match (workflow, template) {
        (None, None) => return Err(invalid_workflow("one of workflow or template is required")),
        (Some(_), Some(_)) => return Err(invalid_workflow("workflow and template are mutually exclusive")),
        _ => {}
    }
    if let Some(template) = template {
        validate_name("template", template)?;
    }
    let session = body
        .session
        .as_deref()
        .map(|session| validate_name("session", session))
        .transpose()?;
    Ok(json!({
        "workflow": workflow,
        "template": template,
        "session": session,
        "vars": body.vars,
        "dry_run": body.dry_run,
    }))
}

/// Run ids come back from the kernel; `adhoc` covers runs it did not name.
fn run_id(result: &Value) -> String {
    result
        .get("run_id")
        .or_else(|| result.get("id"))
        .and_then(Value::as_str)
        .unwrap_or("adhoc")
        .to_string()
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Value> {
    ok(kernel(&state, "pipelines.list", json!({})).await?)
}

pub async fn templates(State(state): State<AppState>) -> ApiResult<Value> {
    ok(kernel(&state, "pipelines.templates", json!({})).await?)
}

pub async fn get(State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> ApiResult<Value> {
    let id = validate_name("id", &id)?;
    ok(kernel(&state, "pipelines.get", json!({ "id": id })).await?)
}

pub async fn exec(
    State(state): State<AppState>,
    ctx: RequestContext,
    ApiJson(body): ApiJson<PipelineExec>,
) -> ApiResult<Value> {
    if body.stages.is_empty() {
        return Err(invalid_workflow("stages must not be empty"));
    }
    if body.stages.iter().any(|stage| !stage.is_object()) {
        return Err(invalid_workflow("every stage must be an object"));
    }
    let session = body
        .session
        .as_deref()
        .map(|session| validate_name("session", session))
        .transpose()?;
    let result = kernel(
        &state,
        "pipelines.exec",
        json!({ "session": session, "stages": body.stages, "vars": body.vars }),
    )
    .await?;
    let id = run_id(&result);
    state.bus.publish(
        &topics::pipeline(&id),
        "pipeline.started",
        json!({ "run_id": id, "stages": body.stages.len(), "by": ctx.identity.user_id }),
    );
    ok(result)
}

pub async fn run(
    State(state): State<AppState>,
    ctx: RequestContext,
    ApiJson(body): ApiJson<PipelineRun>,
) -> ApiResult<Value> {
    let args = run_args(&body)?;
    let result = kernel(&state, "pipelines.run", args).await?;
    if !body.dry_run {
        let id = run_id(&result);
        state.bus.publish(
            &topics::pipeline(&id),
            "pipeline.started",
            json!({ "run_id": id, "template": body.template, "by": ctx.identity.user_id }),
        );
    }
    ok(result)
}

pub async fn validate(State(state): State<AppState>, ApiJson(body): ApiJson<PipelineRun>) -> ApiResult<Value> {
    let args = run_args(&body)?;
    ok(kernel(&state, "pipelines.validate", args).await?)
}

pub async fn resume(
    State(state): State<AppState>,
    ctx: RequestContext,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<Value> {
    let id = validate_name("id", &id)?;
    let result = kernel(&state, "pipelines.resume", json!({ "id": id })).await?;
    state.bus.publish(
        &topics::pipeline(id),
        "pipeline.resumed",
        json!({ "run_id": id, "by": ctx.identity.user_id }),
    );
    ok(result)
}

pub async fn cancel(
    State(state): State<AppState>,
    ctx: RequestContext,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<Value> {
    let id = validate_name("id", &id)?;
    let result = kernel(&state, "pipelines.cancel", json!({ "id": id })).await?;
    state.bus.publish(
        &topics::pipeline(id),
        "pipeline.cancelled",
        json!({ "run_id": id, "by": ctx.identity.user_id }),
    );
    ok(result)
}

pub async fn cleanup(
    State(state): State<AppState>,
    JsonOrDefault(body): JsonOrDefault<CleanupRequest>,
) -> ApiResult<Value> {
    ok(kernel(&state, "pipelines.cleanup", json!({ "older_than": body.older_than })).await?)
}
