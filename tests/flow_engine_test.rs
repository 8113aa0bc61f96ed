use axum::http::StatusCode;
use serde_json::{json, Value};

mod common;

use common::{test_server, test_state};

#[tokio::test]
async fn login_flow_runs_to_completion_over_http() {
    let state = test_state().await;
    let server = test_server(&state).await;

    let started = server
        .post("/flow/login/start")
        .json(&json!({"client_id": "c1"}))
        .await;
    assert_eq!(started.status_code(), StatusCode::OK);
    let body: Value = started.json();
    let session_id = body["session_id"].as_str().unwrap().to_string();
    assert_eq!(body["result"]["type"], "continue");
    assert_eq!(body["result"]["node_id"], "identify");

    let identified: Value = server
        .post("/flow/submit")
        .json(&json!({
            "session_id": session_id,
            "request_id": "req-1",
            "capability_id": "identifier",
            "response": {"identifier": "person@example.com"},
        }))
        .await
        .json();
    assert_eq!(identified["type"], "continue");
    assert_eq!(identified["node_id"], "login");
    assert!(identified["capabilities"]
        .as_array()
        .unwrap()
        .iter()
        .any(|c| c == "password"));

    let logged_in: Value = server
        .post("/flow/submit")
        .json(&json!({
            "session_id": session_id,
            "request_id": "req-2",
            "capability_id": "password",
            "response": {"user_id": "u1", "requires_mfa": false},
        }))
        .await
        .json();
    assert_eq!(logged_in["type"], "continue");
    assert_eq!(logged_in["completed"], true);
}

#[tokio::test]
async fn submit_is_idempotent_for_the_same_request_id() {
    let state = test_state().await;
    let server = test_server(&state).await;

    let started: Value = server
        .post("/flow/login/start")
        .json(&json!({"client_id": "c1"}))
        .await
        .json();
    let session_id = started["session_id"].as_str().unwrap().to_string();

    let submission = json!({
        "session_id": session_id,
        "request_id": "req-1",
        "capability_id": "identifier",
        "response": {"identifier": "person@example.com"},
    });

    let first: Value = server.post("/flow/submit").json(&submission).await.json();
    let replay: Value = server.post("/flow/submit").json(&submission).await.json();
    assert_eq!(first, replay);

    // The machine advanced exactly once.
    let flow_state = state.flows.state_of(&session_id).await.unwrap().unwrap();
    assert_eq!(flow_state.current_node_id, "login");
    assert_eq!(
        flow_state
            .completed_capabilities
            .iter()
            .filter(|c| c.as_str() == "identifier")
            .count(),
        1
    );
}

#[tokio::test]
async fn mfa_branch_is_taken_when_required() {
    let state = test_state().await;
    let server = test_server(&state).await;

    let started: Value = server
        .post("/flow/login/start")
        .json(&json!({"client_id": "c1"}))
        .await
        .json();
    let session_id = started["session_id"].as_str().unwrap().to_string();

    server
        .post("/flow/submit")
        .json(&json!({
            "session_id": session_id,
            "request_id": "req-1",
            "capability_id": "identifier",
            "response": {"identifier": "person@example.com"},
        }))
        .await;

    let after_login: Value = server
        .post("/flow/submit")
        .json(&json!({
            "session_id": session_id,
            "request_id": "req-2",
            "capability_id": "password",
            "response": {"user_id": "u1", "requires_mfa": true},
        }))
        .await
        .json();
    assert_eq!(after_login["node_id"], "mfa");

    let done: Value = server
        .post("/flow/submit")
        .json(&json!({
            "session_id": session_id,
            "request_id": "req-3",
            "capability_id": "totp",
            "response": {"otp_verified": true},
        }))
        .await
        .json();
    assert_eq!(done["completed"], true);
}

#[tokio::test]
async fn failed_login_reaches_the_error_terminal() {
    let state = test_state().await;
    let server = test_server(&state).await;

    let started: Value = server
        .post("/flow/login/start")
        .json(&json!({"client_id": "c1"}))
        .await
        .json();
    let session_id = started["session_id"].as_str().unwrap().to_string();

    server
        .post("/flow/submit")
        .json(&json!({
            "session_id": session_id,
            "request_id": "req-1",
            "capability_id": "identifier",
            "response": {"identifier": "person@example.com"},
        }))
        .await;

    let failed: Value = server
        .post("/flow/submit")
        .json(&json!({
            "session_id": session_id,
            "request_id": "req-2",
            "capability_id": "password",
            "response": {"error": "bad_password"},
        }))
        .await
        .json();
    assert_eq!(failed["type"], "error");
    assert_eq!(failed["code"], "login_failed");
}

#[tokio::test]
async fn unknown_flow_is_rejected() {
    let state = test_state().await;
    let server = test_server(&state).await;

    let response = server
        .post("/flow/nonexistent/start")
        .json(&json!({"client_id": "c1"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}
