use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Form;
use std::collections::HashMap;

use crate::app::error::OAuthError;
use crate::app::models::AuthorizationParams;
use crate::app::services::client_auth_service::ClientAuthParams;
use crate::app::state::AppState;

/// RFC 9126 §2: POST only (the router answers 405 elsewhere), client
/// authentication required, 201 on success.
pub async fn push(
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
    let endpoint = format!("{}/as/par", state.issuer);
    let fapi = state.resolver.fapi_enabled().await;
    let authenticated = state
        .client_auth
        .authenticate(&headers, &ClientAuthParams::from_map(&form), &endpoint, fapi)
        .await?;

    let params = AuthorizationParams::from_map(&form);

    // A pushed request must carry the request itself, not a reference.
    if params.request_uri.is_some() {
        return Err(OAuthError::InvalidRequest(
            "request_uri is not accepted at the PAR endpoint".to_string(),
        ));
    }
    if let Some(param_client) = &params.client_id {
        if *param_client != authenticated.client.client_id {
            return Err(OAuthError::InvalidRequest(
                "client_id does not match the authenticated client".to_string(),
            ));
        }
    }

    // Bind the request to the proof key when a DPoP proof accompanies it.
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
        .par
        .push(&authenticated.client.client_id, params, dpop_jkt)
        .await?;

    Ok((StatusCode::CREATED, axum::Json(response)).into_response())
}
