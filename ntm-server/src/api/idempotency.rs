use super::context::RequestContext;
use super::envelope::ApiError;
use crate::app::idempotency::{Claim, IdempotencyEntry};
use crate::AppState;
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use std::time::Instant;
use tracing::debug;

pub const IDEMPOTENCY_KEY: &str = "idempotency-key";
pub const IDEMPOTENT_REPLAY: &str = "idempotent-replayed";
const MAX_KEY_LEN: usize = 255;

fn mutating(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

/// Keys are scoped to the caller and the route so two users cannot collide.
pub(crate) fn scoped_key(user: &str, method: &Method, path: &str, key: &str) -> String {
    format!("{user}\n{method}\n{path}\n{key}")
}

/// Replays the stored response for a repeated `Idempotency-Key`, and stores
/// successful responses for the first use of a key.
pub async fn idempotency(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !mutating(req.method()) {
        return next.run(req).await;
    }
    let Some(key) = req
        .headers()
        .get(IDEMPOTENCY_KEY)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
    else {
        return next.run(req).await;
    };
    if key.len() > MAX_KEY_LEN {
        return ApiError::invalid_field("Idempotency-Key", format!("key longer than {MAX_KEY_LEN} bytes"))
            .into_response();
    }
    let user = req
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.identity.user_id.clone())
        .unwrap_or_default();
    let scoped = scoped_key(&user, req.method(), req.uri().path(), &key);

    let max_body = state.redactor.config().max_body_bytes;
    let (parts, body) = req.into_parts();
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
    let request_hash = hex::encode(Sha256::digest(&bytes));

    let reservation = match state.idempotency.claim(&scoped) {
        Claim::Stored(entry) => {
            if entry.request_hash != request_hash {
                return ApiError::conflict("Idempotency-Key was already used with a different request body")
                    .into_response();
            }
            debug!(key = %key, "replaying idempotent response");
            return replay(entry);
        }
        Claim::InFlight => {
            return ApiError::conflict("a request with this Idempotency-Key is still in progress")
                .into_response();
        }
        Claim::Reserved(reservation) => reservation,
    };

    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;
    if !response.status().is_success() {
        return response;
    }
    let (parts, body) = response.into_parts();
    let body = match to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(err) => return ApiError::internal(format!("reading response body: {err}")).into_response(),
    };
    reservation.complete(IdempotencyEntry {
        status: parts.status.as_u16(),
        body: body.to_vec(),
        content_type: parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        request_hash,
        inserted_at: Instant::now(),
    });
    Response::from_parts(parts, Body::from(body))
}

fn replay(entry: IdempotencyEntry) -> Response {
    let status = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);
    let mut response = (status, entry.body).into_response();
    let headers = response.headers_mut();
    if let Some(value) = entry
        .content_type
        .as_deref()
        .and_then(|content_type| HeaderValue::from_str(content_type).ok())
    {
        headers.insert(CONTENT_TYPE, value);
    }
    headers.insert(IDEMPOTENT_REPLAY, HeaderValue::from_static("true"));
    response
}
