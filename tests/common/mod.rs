// Shared by several integration test binaries; not every binary uses every
// helper.
#![allow(dead_code)]

use axum_test::TestServer;

use oxauth::app::models::client::TokenEndpointAuthMethod;
use oxauth::app::models::Client;
use oxauth::app::state::AppState;
use oxauth::config::Config;

pub async fn test_state() -> AppState {
    test_state_with(|_| {}).await
}

pub async fn test_state_with<F: FnOnce(&mut Config)>(mutate: F) -> AppState {
    let mut config = Config::from_env().expect("config loads from defaults");
    mutate(&mut config);
    AppState::build(config).await.expect("state builds")
}

pub async fn test_server(state: &AppState) -> TestServer {
    TestServer::new(oxauth::create_app_with_state(state.clone())).expect("server starts")
}

pub fn public_client(client_id: &str) -> Client {
    Client {
        client_id: client_id.to_string(),
        secret: None,
        redirect_uris: vec!["https://rp/cb".to_string()],
        token_endpoint_auth_method: TokenEndpointAuthMethod::None,
        jwks: None,
        jwks_uri: None,
        id_token_encrypted_response_alg: None,
        id_token_encrypted_response_enc: None,
        allow_claims_without_scope: false,
        allowed_scopes: vec![],
        require_pushed_authorization_requests: false,
        certificate_thumbprint: None,
        tenant_id: "default".to_string(),
    }
}

/// Authenticated browser session; returns the cookie header value.
pub async fn login_session(state: &AppState, user_id: &str) -> String {
    let session = state
        .sessions
        .create_session(user_id, vec!["pwd".to_string()], None, None, serde_json::Value::Null)
        .await
        .expect("session creates");
    format!("{}={}", state.cookie_name, session.sid)
}

pub fn location_of(response: &axum_test::TestResponse) -> String {
    response
        .headers()
        .get("location")
        .expect("redirect has a location")
        .to_str()
        .unwrap()
        .to_string()
}

pub fn query_param(location: &str, name: &str) -> Option<String> {
    let parsed = url::Url::parse(location).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.to_string())
}
