use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::app::services::rate_limiter::RateDecision;
use crate::app::state::AppState;
use crate::config::rate_limit::EndpointClass;

/// Per-IP fixed-window limiting for the protocol endpoints. Decisions ride
/// back on the `X-RateLimit-*` headers; over-limit requests get a 429 with
/// `Retry-After`.
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let class = match classify(request.uri().path()) {
        Some(class) => class,
        None => return next.run(request).await,
    };

    let ip = client_ip(request.headers());
    let decision = state.rate_limiter.check(class, &ip).await;

    if !decision.allowed {
        tracing::warn!(ip = %ip, class = class.as_str(), "rate limit exceeded");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "slow_down",
                "error_description": "rate limit exceeded",
            })),
        )
            .into_response();
        apply_headers(&mut response, &decision);
        if let Ok(value) = decision.retry_after.to_string().parse() {
            response.headers_mut().insert("Retry-After", value);
        }
        return response;
    }

    let mut response = next.run(request).await;
    apply_headers(&mut response, &decision);
    response
}

fn classify(path: &str) -> Option<EndpointClass> {
    match path {
        "/authorize" | "/authorize/resume" => Some(EndpointClass::Authorize),
        "/token" => Some(EndpointClass::Token),
        "/as/par" => Some(EndpointClass::Par),
        "/introspect" | "/revoke" => Some(EndpointClass::Introspect),
        "/bc-authorize" | "/device_authorization" => Some(EndpointClass::Backchannel),
        _ => None,
    }
}

fn apply_headers(response: &mut Response, decision: &RateDecision) {
    let headers = response.headers_mut();
    if let Ok(value) = decision.limit.to_string().parse() {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = decision.remaining.to_string().parse() {
        headers.insert("X-RateLimit-Remaining", value);
    }
    if let Ok(value) = decision.reset.to_string().parse() {
        headers.insert("X-RateLimit-Reset", value);
    }
}

/// Request origin for counting: forwarded headers first (edge deployments sit
/// behind a proxy), then the socket address recorded by the server.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|h| h.to_str().ok()) {
        return real_ip.to_string();
    }
    "unknown".to_string()
}
