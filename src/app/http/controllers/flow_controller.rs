use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use ulid::Ulid;

use crate::app::error::OAuthError;
use crate::app::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StartFlowRequest {
    pub client_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub oauth_params: Value,
    #[serde(default)]
    pub claims: Value,
}

/// Start (or restart) a flow run for a UI session.
pub async fn start(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
    Json(body): Json<StartFlowRequest>,
) -> Response {
    let session_id = body
        .session_id
        .unwrap_or_else(|| Ulid::new().to_string());

    match state
        .flows
        .start(
            &flow_id,
            &session_id,
            &body.client_id,
            body.oauth_params,
            body.claims,
        )
        .await
    {
        Ok(response) => Json(serde_json::json!({
            "session_id": session_id,
            "result": response,
        }))
        .into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitFlowRequest {
    pub session_id: String,
    pub request_id: String,
    pub capability_id: String,
    #[serde(default)]
    pub response: Value,
}

/// Idempotent step submission from the form renderer.
pub async fn submit(State(state): State<AppState>, Json(body): Json<SubmitFlowRequest>) -> Response {
    if body.request_id.is_empty() {
        return OAuthError::InvalidRequest("request_id is required".to_string()).into_response();
    }

    match state
        .flows
        .submit(
            &body.session_id,
            &body.request_id,
            &body.capability_id,
            body.response,
        )
        .await
    {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}
