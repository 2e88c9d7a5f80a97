mod common;

use common::{client, start};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::timeout;

async fn read_until(response: &mut reqwest::Response, buffer: &mut String, needle: &str) {
    timeout(Duration::from_secs(5), async {
        while !buffer.contains(needle) {
            let chunk = response.chunk().await.unwrap().expect("stream ended early");
            buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}; got {buffer:?}"));
}

#[tokio::test]
async fn health_reports_components_and_echoes_request_ids() {
    let server = start(|_| {}).await;

    let response = client()
        .get(server.url("/api/v1/health"))
        .header("X-Request-Id", "req-e2e-1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "req-e2e-1");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["request_id"], "req-e2e-1");
    assert!(body["timestamp"].as_str().is_some());

    server.stop().await;
}

#[tokio::test]
async fn openapi_document_lists_registry_routes() {
    let server = start(|_| {}).await;
    let http = client();

    let doc: Value = http
        .get(server.url("/api/v1/openapi.json"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(doc["openapi"], "3.1.0");
    assert!(doc["paths"]["/api/v1/sessions/{id}"]["delete"].is_object());
    assert!(doc["paths"]["/api/v1/safety/approvals/{id}/approve"]["post"].is_object());

    let docs = http.get(server.url("/api/v1/docs")).send().await.unwrap();
    assert_eq!(docs.status(), StatusCode::OK);
    assert!(docs.text().await.unwrap().contains("openapi.json"));

    server.stop().await;
}

#[tokio::test]
async fn published_events_reach_sse_and_replay() {
    let server = start(|_| {}).await;
    let http = client();

    let mut stream = http
        .get(server.url("/events?topics=sessions:*"))
        .send()
        .await
        .unwrap();
    assert_eq!(stream.status(), StatusCode::OK);
    let mut buffer = String::new();
    read_until(&mut stream, &mut buffer, "event: connected").await;

    let sent = http
        .post(server.url("/api/v1/sessions/proj/agents/send"))
        .json(&json!({ "message": "run the tests" }))
        .send()
        .await
        .unwrap();
    assert_eq!(sent.status(), StatusCode::OK);
    read_until(&mut stream, &mut buffer, "event: agent.prompted").await;
    assert!(buffer.contains("sessions:proj"));

    let replay: Value = http
        .get(server.url("/api/v1/events/replay?since_seq=0&topic=sessions:proj"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(replay["reset"], false);
    assert!(replay["count"].as_u64().unwrap() >= 1);
    assert_eq!(replay["events"][0]["topic"], "sessions:proj");

    drop(stream);
    server.stop().await;
}

#[tokio::test]
async fn disabled_surfaces_are_not_routed() {
    let server = start(|settings| {
        settings.features.sse = false;
        settings.features.openapi = false;
    })
    .await;
    let http = client();

    let events = http.get(server.url("/events")).send().await.unwrap();
    assert_eq!(events.status(), StatusCode::NOT_FOUND);
    let doc = http.get(server.url("/api/v1/openapi.json")).send().await.unwrap();
    assert_eq!(doc.status(), StatusCode::NOT_FOUND);
    let body: Value = doc.json().await.unwrap();
    assert_eq!(body["error_code"], "NOT_FOUND");

    server.stop().await;
}

#[tokio::test]
async fn stop_closes_the_listener() {
    let server = start(|_| {}).await;
    let health = server.url("/api/v1/health");
    server.stop().await;

    assert!(client().get(&health).send().await.is_err());
}
