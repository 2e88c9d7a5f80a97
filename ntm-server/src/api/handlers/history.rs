use super::{kernel, split_list, validate_name};
use crate::api::envelope::{ok, ApiError, ApiResult};
use crate::api::extract::{ApiPath, ApiQuery};
use crate::AppState;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{json, Value};

const OUTPUT_KINDS: &[&str] = &["tail", "diff", "files", "summary"];
const MAX_HISTORY: u32 = 1000;

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub pane: Option<u32>,
    #[serde(default)]
    pub agent_type: Option<String>,
    /// A duration such as `1h` or an RFC 3339 time; the kernel interprets it.
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub last: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OutputQuery {
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub panes: Option<String>,
    #[serde(default)]
    pub since: Option<String>,
}

fn required_session(session: Option<&str>) -> Result<&str, ApiError> {
    let session = session.ok_or_else(|| ApiError::invalid_field("session", "session is required"))?;
    validate_name("session", session)
}

pub async fn list(State(state): State<AppState>, ApiQuery(query): ApiQuery<HistoryQuery>) -> ApiResult<Value> {
    let session = required_session(query.session.as_deref())?;
    if query.last.is_some_and(|last| last == 0 || last > MAX_HISTORY) {
        return Err(ApiError::invalid_field(
            "last",
            format!("last must be between 1 and {MAX_HISTORY}"),
        ));
    }
    ok(kernel(
        &state,
        "history.list",
        json!({
            "session": session,
            "pane": query.pane,
            "agent_type": query.agent_type,
            "since": query.since,
            "last": query.last,
        }),
    )
    .await?)
}

pub async fn output(
    State(state): State<AppState>,
    ApiPath(kind): ApiPath<String>,
    ApiQuery(query): ApiQuery<OutputQuery>,
) -> ApiResult<Value> {
    if !OUTPUT_KINDS.contains(&kind.as_str()) {
        return Err(ApiError::invalid_field(
            "kind",
            format!("kind must be one of {}", OUTPUT_KINDS.join(", ")),
        ));
    }
    let session = required_session(query.session.as_deref())?;
    let panes = split_list(query.panes.as_deref())
        .iter()
        .map(|pane| pane.parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ApiError::invalid_field("panes", "panes must list pane indexes"))?;
    ok(kernel(
        &state,
        &format!("output.{kind}"),
        json!({ "session": session, "panes": panes, "since": query.since }),
    )
    .await?)
}
