//! Extractors whose rejections use the error envelope.

use super::envelope::ApiError;
use axum::async_trait;
use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Request};
use serde::de::DeserializeOwned;

#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        invalid_input(rejection.body_text(), "body")
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        invalid_input(rejection.body_text(), "query")
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::invalid_field("path", rejection.body_text())
    }
}

/// A JSON body that may be omitted entirely; an empty body yields
/// `T::default()` while malformed JSON is still a 400.
#[derive(Debug)]
pub struct JsonOrDefault<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonOrDefault<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Default,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|err| ApiError::bad_request(err.body_text()))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self(T::default()));
        }
        serde_json::from_slice(&bytes)
            .map(Self)
            .map_err(|err| invalid_input(format!("invalid JSON body: {err}"), "body"))
    }
}

/// A 400 naming the field serde complained about, or `fallback`.
fn invalid_input(message: String, fallback: &str) -> ApiError {
    let field = field_hint(&message).unwrap_or(fallback).to_string();
    ApiError::invalid_field(&field, message)
}

/// Pulls the field name out of serde messages such as "missing field `action`".
fn field_hint(message: &str) -> Option<&str> {
    let start = message.find("field `")? + "field `".len();
    let rest = &message[start..];
    rest.find('`').map(|end| &rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_hints_come_from_serde_messages() {
        assert_eq!(field_hint("missing field `action` at line 1 column 2"), Some("action"));
        assert_eq!(field_hint("unknown field `foo`, expected one of"), Some("foo"));
        assert_eq!(field_hint("expected value at line 1 column 1"), None);
    }

    #[tokio::test]
    async fn malformed_bodies_name_the_offending_field() {
        use axum::http::StatusCode;
        use axum::response::IntoResponse;

        #[derive(Debug, Default, serde::Deserialize)]
        struct Body {
            #[allow(dead_code)]
            action: String,
        }

        let request = axum::http::Request::builder()
            .body(axum::body::Body::from(r#"{"reason": "x"}"#))
            .unwrap();
        let err = JsonOrDefault::<Body>::from_request(request, &()).await.unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["details"]["field"], "action");

        let empty = axum::http::Request::builder().body(axum::body::Body::empty()).unwrap();
        assert!(JsonOrDefault::<Body>::from_request(empty, &()).await.is_ok());
    }
}
