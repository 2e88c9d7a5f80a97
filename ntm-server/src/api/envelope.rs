//! Response envelopes and the HTTP error type.
//!
//! Every success body is `{success: true, ...fields, request_id, timestamp}`
//! and every failure is `{success: false, error, error_code, details?,
//! request_id, timestamp}`. Handlers return typed payloads; they become JSON
//! only here.

use crate::app::approvals::ApprovalError;
use crate::app::audit::AuditError;
use crate::app::auth::AuthError;
use crate::app::events::EventStoreError;
use crate::app::jobs::JobError;
use crate::app::safety::SafetyError;
use crate::app::streams::StreamError;
use crate::domain::approvals::DecisionError;
use crate::ports::AdapterError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;
use tracing::warn;

tokio::task_local! {
    pub static REQUEST_ID: String;
}

/// The id of the request being served, or empty outside a request.
pub fn current_request_id() -> String {
    REQUEST_ID.try_with(Clone::clone).unwrap_or_default()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    Unprocessable,
    ServiceUnavailable,
    Internal,
    DependencyMissing,
    ApprovalRequired,
    InvalidWorkflow,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 11] = [
        ErrorCode::BadRequest,
        ErrorCode::Unauthenticated,
        ErrorCode::Forbidden,
        ErrorCode::NotFound,
        ErrorCode::Conflict,
        ErrorCode::Unprocessable,
        ErrorCode::ServiceUnavailable,
        ErrorCode::Internal,
        ErrorCode::DependencyMissing,
        ErrorCode::ApprovalRequired,
        ErrorCode::InvalidWorkflow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Unprocessable => "UNPROCESSABLE",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::DependencyMissing => "DEPENDENCY_MISSING",
            ErrorCode::ApprovalRequired => "APPROVAL_REQUIRED",
            ErrorCode::InvalidWorkflow => "INVALID_WORKFLOW",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Carried on error responses so the audit layer can record the message.
#[derive(Clone, Debug)]
pub struct ErrorMessage(pub String);

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
    pub approval: Option<Value>,
}

pub type ApiResult<T> = Result<Success<T>, ApiError>;

impl ApiError {
    pub fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
            approval: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::BadRequest, message)
    }

    /// A 400 naming the offending input field.
    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        Self::bad_request(message).with_details(json!({ "field": field }))
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorCode::Unauthenticated, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, ErrorCode::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, ErrorCode::Conflict, message)
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, ErrorCode::Unprocessable, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, ErrorCode::ServiceUnavailable, message)
    }

    pub fn dependency_missing(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, ErrorCode::DependencyMissing, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Internal, message)
    }

    pub fn approval_required(approval: Value) -> Self {
        let message = approval
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("approval required")
            .to_string();
        Self {
            approval: Some(approval),
            ..Self::new(StatusCode::CONFLICT, ErrorCode::ApprovalRequired, message)
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.status.as_u16(), self.code, self.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(code = %self.code, error = %self.message, "request failed");
        }
        let mut body = Map::new();
        body.insert("success".into(), Value::Bool(false));
        body.insert("error".into(), Value::String(self.message.clone()));
        body.insert("error_code".into(), json!(self.code));
        if let Some(details) = self.details {
            body.insert("details".into(), details);
        }
        if let Some(approval) = self.approval {
            body.insert("approval".into(), approval);
        }
        stamp(&mut body);
        let mut response = (self.status, Json(Value::Object(body))).into_response();
        response.extensions_mut().insert(ErrorMessage(self.message));
        response
    }
}

/// A 200 response wrapping `T` in the success envelope. Object payloads are
/// flattened into the envelope; anything else lands under `data`.
#[derive(Debug)]
pub struct Success<T>(pub T);

pub fn ok<T>(payload: T) -> ApiResult<T> {
    Ok(Success(payload))
}

impl<T: Serialize> IntoResponse for Success<T> {
    fn into_response(self) -> Response {
        let payload = match serde_json::to_value(&self.0) {
            Ok(payload) => payload,
            Err(err) => return ApiError::internal(format!("encoding response: {err}")).into_response(),
        };
        let mut body = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".into(), other);
                map
            }
        };
        body.insert("success".into(), Value::Bool(true));
        stamp(&mut body);
        Json(Value::Object(body)).into_response()
    }
}

fn stamp(body: &mut Map<String, Value>) {
    body.insert("request_id".into(), Value::String(current_request_id()));
    body.insert("timestamp".into(), json!(Utc::now()));
}

impl From<AdapterError> for ApiError {
    fn from(err: AdapterError) -> Self {
        let message = err.to_string();
        match err {
            AdapterError::DependencyMissing(_) => ApiError::dependency_missing(message),
            AdapterError::NotFound(_) => ApiError::not_found(message),
            AdapterError::Invalid(_) => ApiError::bad_request(message),
            AdapterError::InvalidWorkflow(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, ErrorCode::InvalidWorkflow, message)
            }
            AdapterError::Conflict(_) => ApiError::conflict(message),
            AdapterError::Unavailable(_) | AdapterError::Timeout(_) => ApiError::unavailable(message),
            AdapterError::Failed(_) => ApiError::internal(message),
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(err: ApprovalError) -> Self {
        let message = err.to_string();
        match err {
            ApprovalError::NotFound(_) => ApiError::not_found(message),
            ApprovalError::Decision(DecisionError::NotPending(_)) => ApiError::conflict(message),
            ApprovalError::Decision(DecisionError::SelfApproval) => ApiError::forbidden(message),
            ApprovalError::NotAuthorized { .. } => ApiError::forbidden(message),
            ApprovalError::Invalid(_) => ApiError::invalid_field("action", message),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let message = err.to_string();
        match err {
            JobError::UnknownType(_) => ApiError::invalid_field("type", message),
            JobError::NotFound(_) => ApiError::not_found(message),
            JobError::Finished { .. } => ApiError::conflict(message),
        }
    }
}

impl From<SafetyError> for ApiError {
    fn from(err: SafetyError) -> Self {
        match err {
            SafetyError::InvalidPolicy(report) => ApiError::invalid_field("content", "policy is invalid")
                .with_details(json!({ "field": "content", "errors": report.errors, "warnings": report.warnings })),
            SafetyError::Policy(err) => ApiError::invalid_field("content", err.to_string()),
            SafetyError::Conflict(paths) => ApiError::conflict(format!(
                "{} file(s) already exist; pass force to overwrite",
                paths.len()
            ))
            .with_details(json!({ "paths": paths })),
            SafetyError::Io(err) => ApiError::internal(format!("{err:#}")),
        }
    }
}

impl From<AuditError> for ApiError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::NoDatabase | AuditError::Closed => ApiError::unavailable(err.to_string()),
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        ApiError::not_found(err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        if err.is_unavailable() {
            ApiError::unavailable(err.to_string())
        } else {
            ApiError::unauthenticated(err.to_string())
        }
    }
}

impl From<EventStoreError> for ApiError {
    fn from(err: EventStoreError) -> Self {
        ApiError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn success_flattens_objects_and_wraps_the_rest() {
        let response = REQUEST_ID
            .scope("req-1".into(), async { Success(json!({"id": "apr-1"})).into_response() })
            .await;
        let value = body(response).await;
        assert_eq!(value["success"], true);
        assert_eq!(value["id"], "apr-1");
        assert_eq!(value["request_id"], "req-1");
        assert!(value["timestamp"].is_string());

        let value = body(Success(vec![1, 2]).into_response()).await;
        assert_eq!(value["data"], json!([1, 2]));
    }

    #[tokio::test]
    async fn adapter_errors_map_to_codes() {
        let cases = [
            (AdapterError::DependencyMissing("caam".into()), 503, "DEPENDENCY_MISSING"),
            (AdapterError::NotFound("x".into()), 404, "NOT_FOUND"),
            (AdapterError::Invalid("x".into()), 400, "BAD_REQUEST"),
            (AdapterError::InvalidWorkflow("x".into()), 400, "INVALID_WORKFLOW"),
            (AdapterError::Conflict("x".into()), 409, "CONFLICT"),
            (AdapterError::Timeout("x".into()), 503, "SERVICE_UNAVAILABLE"),
            (AdapterError::Failed("x".into()), 500, "INTERNAL"),
        ];
        for (err, status, code) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status().as_u16(), status);
            let value = body(response).await;
            assert_eq!(value["success"], false);
            assert_eq!(value["error_code"], code);
        }
    }

    #[tokio::test]
    async fn approval_required_carries_the_approval() {
        let response = ApiError::approval_required(json!({
            "approval_id": "apr-3",
            "message": "session.kill requires approval",
        }))
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let value = body(response).await;
        assert_eq!(value["error_code"], "APPROVAL_REQUIRED");
        assert_eq!(value["approval"]["approval_id"], "apr-3");
        assert_eq!(value["error"], "session.kill requires approval");
    }

    #[test]
    fn error_codes_render_screaming_snake_case() {
        for code in ErrorCode::ALL {
            assert_eq!(json!(code), json!(code.as_str()));
        }
    }
}
