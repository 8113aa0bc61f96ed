use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Form;
use std::collections::HashMap;

use crate::app::http::responses::render_form_post;
use crate::app::models::AuthorizationParams;
use crate::app::services::AuthorizeOutcome;
use crate::app::state::AppState;

pub async fn authorize_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let sid = session_cookie(&headers, &state.cookie_name);
    let outcome = state
        .authorize
        .authorize(AuthorizationParams::from_map(&query), sid.as_deref())
        .await;
    respond(&state, outcome)
}

pub async fn authorize_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let sid = session_cookie(&headers, &state.cookie_name);
    let outcome = state
        .authorize
        .authorize(AuthorizationParams::from_map(&form), sid.as_deref())
        .await;
    respond(&state, outcome)
}

/// Callback for the trusted external login UI once the user authenticated.
/// The challenge is single-use; replays see `invalid_request`.
pub async fn resume(
    State(state): State<AppState>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let challenge_id = match form.get("challenge_id") {
        Some(id) if !id.is_empty() => id.clone(),
        _ => return (StatusCode::BAD_REQUEST, "challenge_id is required").into_response(),
    };
    let user_id = match form.get("user_id") {
        Some(id) if !id.is_empty() => id.clone(),
        _ => return (StatusCode::BAD_REQUEST, "user_id is required").into_response(),
    };
    let amr: Vec<String> = form
        .get("amr")
        .map(|v| v.split_whitespace().map(|s| s.to_string()).collect())
        .unwrap_or_else(|| vec!["pwd".to_string()]);
    let acr = form.get("acr").filter(|v| !v.is_empty()).cloned();

    let outcome = state.authorize.resume(&challenge_id, &user_id, amr, acr).await;
    respond(&state, outcome)
}

fn respond(state: &AppState, outcome: AuthorizeOutcome) -> Response {
    match outcome {
        AuthorizeOutcome::Redirect(location) => redirect(&location),
        AuthorizeOutcome::FormPost { action, fields } => {
            let pairs: Vec<(&str, &str)> = fields
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str()))
                .collect();
            render_form_post(&action, &pairs).into_response()
        }
        AuthorizeOutcome::LoginRequired { challenge_id } => {
            let location = format!(
                "{}/login?challenge_id={}",
                state.issuer,
                urlencoding::encode(&challenge_id)
            );
            redirect(&location)
        }
        AuthorizeOutcome::Fail(err) => err.into_response(),
    }
}

fn redirect(location: &str) -> Response {
    match location.parse::<axum::http::HeaderValue>() {
        Ok(value) => {
            let mut response = StatusCode::FOUND.into_response();
            response.headers_mut().insert(header::LOCATION, value);
            response
        }
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

fn session_cookie(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == cookie_name).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "other=1; oxauth_sid=abc123; trailing=x".parse().unwrap(),
        );
        assert_eq!(
            session_cookie(&headers, "oxauth_sid").as_deref(),
            Some("abc123")
        );
        assert_eq!(session_cookie(&headers, "missing"), None);
    }
}
