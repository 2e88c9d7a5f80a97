use super::{kernel, require_text, validate_name};
use crate::api::envelope::{ok, ApiError, ApiResult};
use crate::api::extract::{ApiJson, ApiPath, ApiQuery, JsonOrDefault};
use crate::domain::events::topics;
use crate::AppState;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

pub const DEFAULT_OUTPUT_LINES: u32 = 100;
pub const MAX_OUTPUT_LINES: u32 = 10_000;

#[derive(Debug, Default, Deserialize)]
pub struct OutputQuery {
    #[serde(default)]
    pub lines: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PaneInput {
    pub text: String,
    #[serde(default = "default_enter")]
    pub enter: bool,
}

fn default_enter() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct PaneTitle {
    pub title: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamRequest {
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

pub(crate) fn output_lines(requested: Option<u32>) -> Result<u32, ApiError> {
    match requested {
        None => Ok(DEFAULT_OUTPUT_LINES),
        Some(0) => Err(ApiError::invalid_field("lines", "lines must be positive")),
        Some(lines) if lines > MAX_OUTPUT_LINES => Err(ApiError::invalid_field(
            "lines",
            format!("lines must be at most {MAX_OUTPUT_LINES}"),
        )),
        Some(lines) => Ok(lines),
    }
}

pub async fn list(State(state): State<AppState>, ApiPath(id): ApiPath<String>) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    ok(kernel(&state, "panes.list", json!({ "session": session })).await?)
}

pub async fn output(
    State(state): State<AppState>,
    ApiPath((id, idx)): ApiPath<(String, u32)>,
    ApiQuery(query): ApiQuery<OutputQuery>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    let lines = output_lines(query.lines)?;
    ok(kernel(
        &state,
        "panes.output",
        json!({ "session": session, "pane": idx, "lines": lines }),
    )
    .await?)
}

pub async fn input(
    State(state): State<AppState>,
    ApiPath((id, idx)): ApiPath<(String, u32)>,
    ApiJson(body): ApiJson<PaneInput>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    if body.text.is_empty() {
        return Err(ApiError::invalid_field("text", "text must not be empty"));
    }
    let result = kernel(
        &state,
        "panes.input",
        json!({ "session": session, "pane": idx, "text": body.text, "enter": body.enter }),
    )
    .await?;
    state.bus.publish(
        &topics::pane(session, idx),
        "pane.input",
        json!({ "session": session, "pane": idx, "bytes": body.text.len(), "enter": body.enter }),
    );
    ok(result)
}

pub async fn title_get(
    State(state): State<AppState>,
    ApiPath((id, idx)): ApiPath<(String, u32)>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    ok(kernel(&state, "panes.title.get", json!({ "session": session, "pane": idx })).await?)
}

pub async fn title_set(
    State(state): State<AppState>,
    ApiPath((id, idx)): ApiPath<(String, u32)>,
    ApiJson(body): ApiJson<PaneTitle>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    let title = require_text("title", &body.title)?;
    ok(kernel(
        &state,
        "panes.title.set",
        json!({ "session": session, "pane": idx, "title": title }),
    )
    .await?)
}

pub async fn interrupt(
    State(state): State<AppState>,
    ApiPath((id, idx)): ApiPath<(String, u32)>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    ok(kernel(&state, "panes.interrupt", json!({ "session": session, "pane": idx })).await?)
}

pub async fn stream_start(
    State(state): State<AppState>,
    ApiPath((id, idx)): ApiPath<(String, u32)>,
    JsonOrDefault(body): JsonOrDefault<StreamRequest>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    let (stream, created) = state
        .streams
        .start(session, idx, body.interval_ms.map(Duration::from_millis));
    ok(json!({ "stream": stream, "created": created }))
}

pub async fn stream_stop(
    State(state): State<AppState>,
    ApiPath((id, idx)): ApiPath<(String, u32)>,
) -> ApiResult<Value> {
    let session = validate_name("id", &id)?;
    let stream = state.streams.stop(session, idx).await?;
    ok(json!({ "stream": stream, "stopped": true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_lines_are_bounded() {
        assert_eq!(output_lines(None).unwrap(), DEFAULT_OUTPUT_LINES);
        assert_eq!(output_lines(Some(500)).unwrap(), 500);
        assert!(output_lines(Some(0)).is_err());
        assert!(output_lines(Some(MAX_OUTPUT_LINES + 1)).is_err());
    }
}
