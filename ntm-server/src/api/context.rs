use super::envelope::{ApiError, REQUEST_ID};
use axum::extract::{FromRequestParts, Request};
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use tracing::{error, info_span, Instrument};
use uuid::Uuid;

use crate::domain::rbac::Identity;

pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
const MAX_REQUEST_ID_LEN: usize = 128;

/// Who is calling, attached by the auth layer and read by handlers.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub identity: Identity,
    pub remote_addr: Option<SocketAddr>,
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .ok_or_else(|| ApiError::forbidden("no role context"))
    }
}

/// The request id as accepted or generated by [`request_context`].
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

fn well_formed(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
}

/// Outermost layer: assigns the request id, opens the request span, and turns
/// a panicking handler into a 500 envelope.
pub async fn request_context(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|id| well_formed(id))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
    );
    let outcome = REQUEST_ID
        .scope(
            request_id.clone(),
            AssertUnwindSafe(next.run(req)).catch_unwind(),
        )
        .instrument(span.clone())
        .await;

    let mut response = match outcome {
        Ok(response) => response,
        Err(panic) => {
            let _entered = span.enter();
            error!(panic = %panic_message(panic.as_ref()), "handler panicked");
            REQUEST_ID.sync_scope(request_id.clone(), || {
                ApiError::internal(format!("internal error (request {request_id})")).into_response()
            })
        }
    };
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID.clone(), value);
    }
    response
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".into()
    }
}
