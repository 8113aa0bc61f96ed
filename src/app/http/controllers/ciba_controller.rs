use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use serde_json::json;
use std::collections::HashMap;

use crate::app::error::OAuthError;
use crate::app::models::ciba_request::CibaDeliveryMode;
use crate::app::services::ciba_service::BackchannelAuthParams;
use crate::app::services::client_auth_service::ClientAuthParams;
use crate::app::state::AppState;

/// CIBA backchannel authentication endpoint.
pub async fn bc_authorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let endpoint = format!("{}/bc-authorize", state.issuer);
    let fapi = state.resolver.fapi_enabled().await;
    let authenticated = match state
        .client_auth
        .authenticate(&headers, &ClientAuthParams::from_map(&form), &endpoint, fapi)
        .await
    {
        Ok(authenticated) => authenticated,
        Err(err) => return err.into_response(),
    };

    let delivery_mode = match form.get("delivery_mode").map(|s| s.as_str()) {
        None | Some("poll") => CibaDeliveryMode::Poll,
        Some("ping") => CibaDeliveryMode::Ping,
        Some("push") => {
            return OAuthError::InvalidRequest(
                "push delivery is not supported".to_string(),
            )
            .into_response()
        }
        Some(_) => {
            return OAuthError::InvalidRequest("unknown delivery_mode".to_string()).into_response()
        }
    };

    let take = |key: &str| form.get(key).filter(|v| !v.is_empty()).cloned();
    let params = BackchannelAuthParams {
        scope: take("scope"),
        login_hint: take("login_hint"),
        login_hint_token: take("login_hint_token"),
        id_token_hint: take("id_token_hint"),
        binding_message: take("binding_message"),
        client_notification_token: take("client_notification_token"),
        requested_expiry: take("requested_expiry").and_then(|v| v.parse().ok()),
    };
    let notification_endpoint = take("client_notification_endpoint");

    match state
        .ciba
        .initiate(
            &authenticated.client.client_id,
            delivery_mode,
            notification_endpoint,
            params,
        )
        .await
    {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Callback from the authentication device once the user decided.
pub async fn complete(
    State(state): State<AppState>,
    Path(auth_req_id): Path<String>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let user_id = match form.get("user_id") {
        Some(id) if !id.is_empty() => id.clone(),
        _ => return OAuthError::InvalidRequest("user_id is required".to_string()).into_response(),
    };
    let approved = form
        .get("action")
        .map(|action| action != "deny")
        .unwrap_or(true);

    match state.ciba.complete(&auth_req_id, &user_id, approved).await {
        Ok(settled) => Json(json!({ "settled": settled })).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn status(State(state): State<AppState>, Path(auth_req_id): Path<String>) -> Response {
    match state.ciba.status(&auth_req_id).await {
        Ok(request) => Json(json!({
            "auth_req_id": request.auth_req_id,
            "status": request.status,
            "binding_message": request.binding_message,
            "expires_at": request.expires_at,
        }))
        .into_response(),
        Err(err) => err.into_response(),
    }
}
