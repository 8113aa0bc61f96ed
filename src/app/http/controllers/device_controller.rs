use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use serde_json::json;
use std::collections::HashMap;

use crate::app::error::OAuthError;
use crate::app::http::middleware::client_ip;
use crate::app::services::client_auth_service::ClientAuthParams;
use crate::app::services::device_service::DeviceReply;
use crate::app::services::rate_limiter::{UserCodeLimiterOp, UserCodeLimiterReply};
use crate::app::state::AppState;

/// RFC 8628 §3.1: device authorization request.
pub async fn device_authorization(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let endpoint = format!("{}/device_authorization", state.issuer);
    let authenticated = match state
        .client_auth
        .authenticate(&headers, &ClientAuthParams::from_map(&form), &endpoint, false)
        .await
    {
        Ok(authenticated) => authenticated,
        Err(err) => return err.into_response(),
    };

    let scope = form.get("scope").cloned().unwrap_or_default();
    match state
        .device
        .initiate(&authenticated.client.client_id, &scope)
        .await
    {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Data endpoint for the external verification page: resolve a user code to
/// the pending grant it belongs to.
pub async fn verification_data(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let user_code = match query.get("user_code") {
        Some(code) if !code.is_empty() => code,
        _ => {
            return OAuthError::InvalidRequest("user_code is required".to_string()).into_response()
        }
    };

    match state.device.find_by_user_code(user_code).await {
        Ok(artifact) => Json(json!({
            "user_code": artifact.user_code,
            "client_id": artifact.client_id,
            "scope": artifact.scope,
            "status": artifact.status,
            "expires_at": artifact.expires_at,
        }))
        .into_response(),
        Err(err) => err.into_response(),
    }
}

/// Verification decision posted by the external page with an authenticated
/// user. Failed user-code lookups feed the brute-force limiter.
pub async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let ip = client_ip(&headers);

    match state
        .user_code_limiter
        .call(UserCodeLimiterOp::Check { ip: ip.clone() })
        .await
    {
        Ok(UserCodeLimiterReply::Blocked { retry_after }) => {
            return too_many_attempts(retry_after);
        }
        _ => {}
    }

    let user_code = match form.get("user_code") {
        Some(code) if !code.is_empty() => code.clone(),
        _ => {
            return OAuthError::InvalidRequest("user_code is required".to_string()).into_response()
        }
    };
    let user_id = match form.get("user_id") {
        Some(id) if !id.is_empty() => id.clone(),
        _ => return OAuthError::InvalidRequest("user_id is required".to_string()).into_response(),
    };
    let sub = form.get("sub").cloned().unwrap_or_else(|| user_id.clone());
    let approve = form
        .get("action")
        .map(|action| action != "deny")
        .unwrap_or(true);

    let result = if approve {
        state.device.approve(&user_code, &user_id, &sub).await
    } else {
        state.device.deny(&user_code, &user_id).await
    };

    match result {
        Ok(reply) => {
            let _ = state
                .user_code_limiter
                .call(UserCodeLimiterOp::RecordSuccess { ip })
                .await;
            let status = match reply {
                DeviceReply::Approved => "approved",
                DeviceReply::Denied => "denied",
                DeviceReply::AlreadyApproved => "already_approved",
                DeviceReply::AlreadyDenied => "already_denied",
                _ => "unknown",
            };
            Json(json!({ "status": status })).into_response()
        }
        Err(err) => {
            // A miss counts toward the per-IP brute force budget.
            if let Ok(UserCodeLimiterReply::Blocked { retry_after }) = state
                .user_code_limiter
                .call(UserCodeLimiterOp::RecordFailure { ip })
                .await
            {
                return too_many_attempts(retry_after);
            }
            err.into_response()
        }
    }
}

fn too_many_attempts(retry_after: i64) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "slow_down",
            "error_description": "too many verification attempts",
        })),
    )
        .into_response();
    if let Ok(value) = retry_after.to_string().parse() {
        response.headers_mut().insert("Retry-After", value);
    }
    response
}
