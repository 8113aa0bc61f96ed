use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::app::state::AppState;

/// RFC 8414 / OIDC discovery document.
pub async fn openid_configuration(State(state): State<AppState>) -> Json<Value> {
    let issuer = &state.issuer;
    let fapi = state.resolver.fapi_enabled().await;

    Json(json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/authorize"),
        "token_endpoint": format!("{issuer}/token"),
        "pushed_authorization_request_endpoint": format!("{issuer}/as/par"),
        "introspection_endpoint": format!("{issuer}/introspect"),
        "revocation_endpoint": format!("{issuer}/revoke"),
        "userinfo_endpoint": format!("{issuer}/userinfo"),
        "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
        "backchannel_authentication_endpoint": format!("{issuer}/bc-authorize"),
        "device_authorization_endpoint": format!("{issuer}/device_authorization"),
        "response_types_supported": ["code", "code id_token", "code token", "code id_token token"],
        "response_modes_supported": ["query", "fragment", "form_post"],
        "grant_types_supported": [
            "authorization_code",
            "refresh_token",
            "client_credentials",
            "urn:ietf:params:oauth:grant-type:device_code",
            "urn:openid:params:grant-type:ciba",
            "urn:ietf:params:oauth:grant-type:token-exchange",
        ],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["RS256"],
        "id_token_encryption_alg_values_supported": ["RSA-OAEP-256"],
        "id_token_encryption_enc_values_supported": ["A256GCM"],
        "request_object_signing_alg_values_supported": ["RS256", "PS256", "ES256", "HS256"],
        "token_endpoint_auth_methods_supported": [
            "none",
            "client_secret_basic",
            "client_secret_post",
            "client_secret_jwt",
            "private_key_jwt",
            "tls_client_auth",
        ],
        "code_challenge_methods_supported": ["S256", "plain"],
        "dpop_signing_alg_values_supported": ["ES256", "ES384", "RS256", "PS256"],
        "backchannel_token_delivery_modes_supported": ["poll", "ping"],
        "require_pushed_authorization_requests": fapi,
        "acr_values_supported": state.resolver.acr_values().await,
        "claims_parameter_supported": true,
        "authorization_response_iss_parameter_supported": true,
    }))
}

pub async fn jwks(State(state): State<AppState>) -> Json<Value> {
    Json(state.key_ring.public_jwks().await)
}
