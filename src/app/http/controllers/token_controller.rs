use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use std::collections::HashMap;

use crate::app::error::OAuthError;
use crate::app::services::token_service::TokenRequest;
use crate::app::state::AppState;

pub async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    match handle(state, headers, form).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle(
    state: AppState,
    headers: HeaderMap,
    form: HashMap<String, String>,
) -> Result<Response, OAuthError> {
    let endpoint = format!("{}/token", state.issuer);
    let request = TokenRequest::from_map(&form);
    let fapi = state.resolver.fapi_enabled().await;

    let authenticated = state
        .client_auth
        .authenticate(&headers, &request.client, &endpoint, fapi)
        .await?;

    let dpop_jkt = match headers.get("dpop").and_then(|h| h.to_str().ok()) {
        Some(proof) => Some(
            state
                .dpop
                .verify_proof(proof, "POST", &endpoint, None)
                .await?,
        ),
        None => None,
    };

    let response = state
        .tokens
        .handle(request, &authenticated.client, dpop_jkt)
        .await?;
    Ok(Json(response).into_response())
}
