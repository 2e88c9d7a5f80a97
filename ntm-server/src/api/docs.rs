use super::openapi::{docs_html, render_registry};
use crate::AppState;
use axum::extract::State;
use axum::http::header::HOST;
use axum::http::HeaderMap;
use axum::response::Html;
use axum::Json;
use serde_json::Value;

pub async fn openapi_json() -> Json<Value> {
    Json(render_registry())
}

/// The docs page points its "try it" server at whatever host the browser used.
pub async fn docs(State(state): State<AppState>, headers: HeaderMap) -> Html<String> {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .filter(|proto| proto.eq_ignore_ascii_case("https"))
        .map_or("http", |_| "https");
    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| state.settings.listen.to_string());
    Html(docs_html(scheme, &host))
}
