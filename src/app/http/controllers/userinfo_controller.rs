use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::app::error::OAuthError;
use crate::app::services::token_service::TokenService;
use crate::app::state::AppState;

/// OIDC userinfo. Accepts `Authorization: Bearer` for plain tokens and
/// `Authorization: DPoP` + a proof header for sender-constrained ones.
pub async fn userinfo(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match handle(state, headers).await {
        Ok(response) => response,
        // Resource-server semantics: every failure here is a 401 challenge,
        // including bad proofs.
        Err(OAuthError::InvalidDpopProof(detail)) => {
            OAuthError::InvalidToken(detail).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn handle(state: AppState, headers: HeaderMap) -> Result<Response, OAuthError> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| OAuthError::InvalidToken("missing access token".to_string()))?;

    let (scheme, token) = authorization
        .split_once(' ')
        .ok_or_else(|| OAuthError::InvalidToken("malformed authorization header".to_string()))?;

    let (record, _claims) = state.tokens.verify_access_token(token).await?;

    match &record.cnf_jkt {
        Some(bound_jkt) => {
            if !scheme.eq_ignore_ascii_case("dpop") {
                return Err(OAuthError::InvalidToken(
                    "sender-constrained token requires the DPoP scheme".to_string(),
                ));
            }
            let proof = headers
                .get("dpop")
                .and_then(|h| h.to_str().ok())
                .ok_or_else(|| OAuthError::InvalidDpopProof("missing DPoP proof".to_string()))?;
            let endpoint = format!("{}/userinfo", state.issuer);
            let presented_jkt = state
                .dpop
                .verify_proof(proof, "GET", &endpoint, Some(token))
                .await?;
            if presented_jkt != *bound_jkt {
                return Err(OAuthError::InvalidDpopProof(
                    "proof key does not match the bound key".to_string(),
                ));
            }
        }
        None => {
            if !scheme.eq_ignore_ascii_case("bearer") {
                return Err(OAuthError::InvalidToken(
                    "unsupported authorization scheme".to_string(),
                ));
            }
        }
    }

    let client = state
        .clients
        .find(&record.client_id)
        .await
        .map_err(OAuthError::ServerError)?
        .ok_or_else(|| OAuthError::InvalidToken("token client is gone".to_string()))?;

    Ok(Json(TokenService::userinfo_claims(&record, &client)).into_response())
}
