use super::auth::X_APPROVAL_ID;
use super::context::RequestContext;
use super::envelope::ErrorMessage;
use crate::app::registry::API_PREFIX;
use crate::domain::audit::{audit_verb, AuditRecord};
use crate::AppState;
use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;
use tracing::warn;

/// What the request touched, relative to the API root.
fn resource_of(path: &str) -> String {
    path.strip_prefix(API_PREFIX)
        .unwrap_or(path)
        .trim_matches('/')
        .to_string()
}

fn session_of(path: &str, query: Option<&str>) -> Option<String> {
    let relative = path.strip_prefix(API_PREFIX).unwrap_or(path);
    let mut segments = relative.trim_start_matches('/').split('/');
    if segments.next() == Some("sessions") {
        if let Some(id) = segments.next().filter(|id| !id.is_empty()) {
            return Some(id.to_string());
        }
    }
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "session")
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

fn approval_of(path: &str) -> Option<String> {
    let rest = path.strip_prefix(API_PREFIX)?.strip_prefix("/safety/approvals/")?;
    let id = rest.split('/').next()?;
    (!id.is_empty() && id != "history" && id != "request").then(|| id.to_string())
}

/// Appends one audit row per authenticated request once the handler has
/// answered. A failed write is logged and counted, never surfaced.
pub async fn audit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(ctx) = req.extensions().get::<RequestContext>().cloned() else {
        return next.run(req).await;
    };
    let started = Instant::now();
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let session_id = session_of(&path, req.uri().query());
    let approval_id = req
        .headers()
        .get(X_APPROVAL_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| approval_of(&path));

    let response = next.run(req).await;
    let elapsed = started.elapsed();
    let status = response.status().as_u16();
    if let Some(metrics) = &state.metrics {
        metrics.record_request(&method, &route, status, elapsed.as_secs_f64() * 1000.0);
    }

    let store = state.audit.clone();
    let record = AuditRecord {
        timestamp: None,
        request_id: ctx.request_id,
        user_id: ctx.identity.user_id,
        role: ctx.identity.role.to_string(),
        action: audit_verb(&method, &path).to_string(),
        resource: resource_of(&path),
        method,
        path,
        status_code: status,
        duration_ms: elapsed.as_millis() as u64,
        remote_addr: ctx.remote_addr.map(|addr| addr.to_string()).unwrap_or_default(),
        session_id,
        approval_id,
        error: response
            .extensions()
            .get::<ErrorMessage>()
            .map(|ErrorMessage(message)| message.clone()),
    };
    let outcome = tokio::task::spawn_blocking(move || store.record(record)).await;
    let failure = match outcome {
        Ok(Ok(_)) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(err) => Some(err.to_string()),
    };
    if let Some(err) = failure {
        warn!(error = %err, "audit write failed");
        if let Some(metrics) = &state.metrics {
            metrics.record_audit_failure();
        }
    }
    response
}
