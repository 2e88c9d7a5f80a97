use super::validate_name;
use crate::api::envelope::{ok, ApiError, ApiResult};
use crate::api::extract::{ApiJson, ApiPath, ApiQuery};
use crate::app::jobs::{Job, JobStatus, NewJob};
use crate::AppState;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
}

pub async fn list(State(state): State<AppState>, ApiQuery(query): ApiQuery<ListQuery>) -> ApiResult<Value> {
    let status = query
        .status
        .as_deref()
        .filter(|status| !status.is_empty())
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(|err| ApiError::invalid_field("status", err))?;
    let jobs = state.jobs.list(status);
    ok(json!({ "count": jobs.len(), "jobs": jobs }))
}

pub async fn create(State(state): State<AppState>, ApiJson(mut body): ApiJson<NewJob>) -> ApiResult<Job> {
    if let Some(session) = body.session.as_deref() {
        body.session = Some(validate_name("session", session)?.to_string());
    }
    ok(state.jobs.submit(body)?)
}

pub async fn get(State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> ApiResult<Job> {
    let id = validate_name("id", &id)?;
    ok(state.jobs.get(id)?)
}

pub async fn cancel(State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> ApiResult<Job> {
    let id = validate_name("id", &id)?;
    ok(state.jobs.cancel(id)?)
}
