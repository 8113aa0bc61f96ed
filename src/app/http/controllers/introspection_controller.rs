use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use serde_json::json;
use std::collections::HashMap;

use crate::app::error::OAuthError;
use crate::app::services::client_auth_service::ClientAuthParams;
use crate::app::state::AppState;

/// RFC 7662. Client authentication failures are 401; an unknown token is a
/// 200 with `active: false`.
pub async fn introspect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let endpoint = format!("{}/introspect", state.issuer);
    if let Err(err) = state
        .client_auth
        .authenticate(&headers, &ClientAuthParams::from_map(&form), &endpoint, false)
        .await
    {
        return err.into_response();
    }

    let token = match form.get("token") {
        Some(token) if !token.is_empty() => token,
        _ => {
            return OAuthError::InvalidRequest("token is required".to_string()).into_response();
        }
    };

    match state.introspection.introspect(token).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

/// RFC 7009. Always 200 for well-formed requests, whether or not the token
/// was known.
pub async fn revoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let endpoint = format!("{}/revoke", state.issuer);
    let authenticated = match state
        .client_auth
        .authenticate(&headers, &ClientAuthParams::from_map(&form), &endpoint, false)
        .await
    {
        Ok(authenticated) => authenticated,
        Err(err) => return err.into_response(),
    };

    let token = match form.get("token") {
        Some(token) if !token.is_empty() => token,
        _ => {
            return OAuthError::InvalidRequest("token is required".to_string()).into_response();
        }
    };

    match state.tokens.revoke(token, &authenticated.client).await {
        Ok(()) => (StatusCode::OK, Json(json!({}))).into_response(),
        Err(err) => err.into_response(),
    }
}
