mod common;

use common::{api_keys, client, start, ALICE, BOB, VERA};
use reqwest::StatusCode;
use serde_json::{json, Value};

#[tokio::test]
async fn operator_requests_and_admin_approves_once() {
    let server = start(api_keys).await;
    let http = client();

    let requested: Value = http
        .post(server.url("/api/v1/safety/approvals/request"))
        .header("x-api-key", ALICE)
        .json(&json!({ "action": "git push --force", "resource": "repo:main" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(requested["success"], true);
    assert_eq!(requested["id"], "apr-1");
    assert_eq!(requested["status"], "pending");
    assert_eq!(requested["slb_required"], false);
    assert_eq!(requested["requestor"], "alice");

    let approve = server.url("/api/v1/safety/approvals/apr-1/approve");
    let approved = http.post(&approve).header("x-api-key", BOB).send().await.unwrap();
    assert_eq!(approved.status(), StatusCode::OK);
    let approved: Value = approved.json().await.unwrap();
    assert_eq!(approved["status"], "approved");
    assert_eq!(approved["decision"], "approved");
    assert_eq!(approved["approver"], "bob");

    let again = http.post(&approve).header("x-api-key", BOB).send().await.unwrap();
    assert_eq!(again.status(), StatusCode::CONFLICT);
    let again: Value = again.json().await.unwrap();
    assert_eq!(again["error_code"], "CONFLICT");

    let history: Value = http
        .get(server.url("/api/v1/safety/approvals/history"))
        .header("x-api-key", VERA)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["count"], 1);

    server.stop().await;
}

#[tokio::test]
async fn force_release_needs_a_second_person() {
    let server = start(api_keys).await;
    let http = client();

    let requested: Value = http
        .post(server.url("/api/v1/safety/approvals/request"))
        .header("x-api-key", ALICE)
        .json(&json!({ "action": "force_release", "resource": "reservation:42" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(requested["slb_required"], true);
    let id = requested["id"].as_str().unwrap().to_string();
    let approve = server.url(&format!("/api/v1/safety/approvals/{id}/approve"));

    // Operators hold the approve permission but not for their own request.
    let own = http.post(&approve).header("x-api-key", ALICE).send().await.unwrap();
    assert_eq!(own.status(), StatusCode::FORBIDDEN);

    let other = http.post(&approve).header("x-api-key", BOB).send().await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);

    server.stop().await;
}

#[tokio::test]
async fn viewers_cannot_request_approvals() {
    let server = start(api_keys).await;

    let response = client()
        .post(server.url("/api/v1/safety/approvals/request"))
        .header("x-api-key", VERA)
        .json(&json!({ "action": "session.kill" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    server.stop().await;
}

#[tokio::test]
async fn session_kill_waits_for_an_approval() {
    let server = start(api_keys).await;
    let http = client();
    let kill = server.url("/api/v1/sessions/proj");

    let gated = http.delete(&kill).header("x-api-key", ALICE).send().await.unwrap();
    assert_eq!(gated.status(), StatusCode::CONFLICT);
    let gated: Value = gated.json().await.unwrap();
    assert_eq!(gated["error_code"], "APPROVAL_REQUIRED");
    assert_eq!(gated["approval"]["action"], "session.kill");
    assert_eq!(gated["approval"]["resource"], "proj");
    let id = gated["approval"]["approval_id"].as_str().unwrap().to_string();
    assert_eq!(server.kernel.calls_to("sessions.kill"), 0);

    // An unapproved id does not open the gate.
    let early = http
        .delete(&kill)
        .header("x-api-key", ALICE)
        .header("X-Approval-Id", &id)
        .send()
        .await
        .unwrap();
    assert_eq!(early.status(), StatusCode::FORBIDDEN);

    let approved = http
        .post(server.url(&format!("/api/v1/safety/approvals/{id}/approve")))
        .header("x-api-key", BOB)
        .send()
        .await
        .unwrap();
    assert_eq!(approved.status(), StatusCode::OK);

    let killed = http
        .delete(&kill)
        .header("x-api-key", ALICE)
        .header("X-Approval-Id", &id)
        .send()
        .await
        .unwrap();
    assert_eq!(killed.status(), StatusCode::OK);
    assert_eq!(server.kernel.calls_to("sessions.kill"), 1);

    server.stop().await;
}

#[tokio::test]
async fn approvals_list_filters_by_status() {
    let server = start(api_keys).await;
    let http = client();

    for action in ["session.kill", "policy.reset"] {
        http.post(server.url("/api/v1/safety/approvals/request"))
            .header("x-api-key", ALICE)
            .json(&json!({ "action": action }))
            .send()
            .await
            .unwrap();
    }
    http.post(server.url("/api/v1/safety/approvals/apr-2/deny"))
        .header("x-api-key", BOB)
        .json(&json!({ "reason": "not today" }))
        .send()
        .await
        .unwrap();

    let pending: Value = http
        .get(server.url("/api/v1/safety/approvals?status=pending"))
        .header("x-api-key", VERA)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(pending["count"], 1);
    assert_eq!(pending["approvals"][0]["id"], "apr-1");

    let bad = http
        .get(server.url("/api/v1/safety/approvals?status=maybe"))
        .header("x-api-key", VERA)
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

    server.stop().await;
}
