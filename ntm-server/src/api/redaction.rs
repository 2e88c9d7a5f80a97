//! Secret scanning over JSON request and response bodies.

use super::envelope::{current_request_id, ApiError};
use crate::app::redaction::{Direction, Findings, RedactionMode, RedactionSummary, Scan};
use crate::AppState;
use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            let essence = value.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
            essence == "application/json" || essence.ends_with("+json")
        })
        .unwrap_or(false)
}

enum Rewritten {
    Unchanged(Bytes),
    Replaced(Vec<u8>),
}

/// Scans `bytes` when they parse as JSON. Bodies that do not parse are left
/// for the handler to reject.
fn rewrite(state: &AppState, bytes: Bytes, direction: Direction) -> (Rewritten, Scan) {
    if bytes.is_empty() {
        return (Rewritten::Unchanged(bytes), Scan::default());
    }
    let Ok(mut value) = serde_json::from_slice::<Value>(&bytes) else {
        return (Rewritten::Unchanged(bytes), Scan::default());
    };
    let scan = state.redactor.scan_json(&mut value, direction);
    if !scan.modified {
        return (Rewritten::Unchanged(bytes), scan);
    }
    match serde_json::to_vec(&value) {
        Ok(encoded) => (Rewritten::Replaced(encoded), scan),
        Err(err) => {
            warn!(%err, "re-encoding redacted body failed; keeping original");
            (Rewritten::Unchanged(bytes), scan)
        }
    }
}

fn into_body(headers: &mut HeaderMap, rewritten: Rewritten) -> Body {
    match rewritten {
        Rewritten::Unchanged(bytes) => Body::from(bytes),
        Rewritten::Replaced(bytes) => {
            headers.remove(CONTENT_LENGTH);
            Body::from(bytes)
        }
    }
}

fn blocked_response(direction: Direction, findings: &Findings) -> Response {
    ApiError::unprocessable(format!("{} body contains sensitive content", direction.as_str()))
        .with_details(json!({ "direction": direction.as_str(), "categories": findings.to_map() }))
        .into_response()
}

/// Reads JSON bodies in both directions, masks or rejects secrets according
/// to the configured mode, and logs one summary per request.
pub async fn redact(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let mode = state.redactor.mode();
    if mode == RedactionMode::Off {
        return next.run(req).await;
    }
    let path = req.uri().path().to_string();
    let max_body = state.redactor.config().max_body_bytes;

    let (mut parts, body) = req.into_parts();
    let mut request_scan = Scan::default();
    let body = if is_json(&parts.headers) {
        let bytes = match to_bytes(body, max_body).await {
            Ok(bytes) => bytes,
            Err(_) => {
                return ApiError::new(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    super::envelope::ErrorCode::BadRequest,
                    format!("request body exceeds {max_body} bytes"),
                )
                .into_response();
            }
        };
        let (rewritten, scan) = rewrite(&state, bytes, Direction::Request);
        request_scan = scan;
        if request_scan.blocked {
            summarize(&state, &path, &request_scan.findings, &Findings::default(), true);
            return blocked_response(Direction::Request, &request_scan.findings);
        }
        into_body(&mut parts.headers, rewritten)
    } else {
        body
    };

    let response = next.run(Request::from_parts(parts, body)).await;
    if !is_json(response.headers()) {
        summarize(&state, &path, &request_scan.findings, &Findings::default(), false);
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => return ApiError::internal(format!("reading response body: {err}")).into_response(),
    };
    let (rewritten, response_scan) = rewrite(&state, bytes, Direction::Response);
    summarize(
        &state,
        &path,
        &request_scan.findings,
        &response_scan.findings,
        response_scan.blocked,
    );
    if response_scan.blocked {
        return blocked_response(Direction::Response, &response_scan.findings);
    }
    let body = into_body(&mut parts.headers, rewritten);
    Response::from_parts(parts, body)
}

fn summarize(state: &AppState, path: &str, request: &Findings, response: &Findings, blocked: bool) {
    let request_id = current_request_id();
    let mut categories = request.to_map();
    for (category, count) in response.to_map() {
        *categories.entry(category).or_default() += count;
    }
    let total = request.total() + response.total();
    if total == 0 {
        debug!(%request_id, path, "redaction summary: clean");
        return;
    }
    info!(
        %request_id,
        path,
        request_finds = request.total(),
        response_finds = response.total(),
        categories = ?categories,
        blocked,
        "redaction summary"
    );
    if let Some(metrics) = &state.metrics {
        for (direction, findings) in [(Direction::Request, request), (Direction::Response, response)] {
            for (category, count) in findings.iter() {
                metrics.record_redaction(category.as_str(), direction.as_str(), count as u64);
            }
        }
    }
    state.summaries.push(RedactionSummary {
        request_id,
        path: path.to_string(),
        request_finds: request.total(),
        response_finds: response.total(),
        categories,
        blocked,
        timestamp: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn json_content_types_are_recognised() {
        let mut headers = HeaderMap::new();
        assert!(!is_json(&headers));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
        assert!(is_json(&headers));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/problem+json"));
        assert!(is_json(&headers));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        assert!(!is_json(&headers));
    }
}
