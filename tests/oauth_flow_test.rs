use axum::http::{HeaderName, HeaderValue, StatusCode};
use jsonwebtoken::Algorithm;
use serde_json::Value;

mod common;

use common::{location_of, login_session, public_client, query_param, test_server, test_state};

// RFC 7636 appendix B vector.
const CODE_CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
const CODE_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

fn cookie_header(value: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static("cookie"),
        HeaderValue::from_str(value).unwrap(),
    )
}

#[tokio::test]
async fn par_code_grant_with_pkce_end_to_end() {
    let state = test_state().await;
    state.clients.upsert(public_client("c1")).await.unwrap();
    let server = test_server(&state).await;
    let cookie = login_session(&state, "u1").await;

    // Push the authorization request.
    let par = server
        .post("/as/par")
        .form(&[
            ("client_id", "c1"),
            ("response_type", "code"),
            ("redirect_uri", "https://rp/cb"),
            ("scope", "openid profile"),
            ("state", "S"),
            ("code_challenge", CODE_CHALLENGE),
            ("code_challenge_method", "S256"),
        ])
        .await;
    assert_eq!(par.status_code(), StatusCode::CREATED);
    let par_body: Value = par.json();
    let request_uri = par_body["request_uri"].as_str().unwrap().to_string();
    assert!(request_uri.starts_with("urn:ietf:params:oauth:request_uri:"));
    assert!(par_body["expires_in"].as_i64().unwrap() <= 600);

    // Authorize with the request_uri and an authenticated session.
    let (name, value) = cookie_header(&cookie);
    let authorize = server
        .get("/authorize")
        .add_query_param("client_id", "c1")
        .add_query_param("request_uri", &request_uri)
        .add_header(name, value)
        .await;
    assert_eq!(authorize.status_code(), StatusCode::FOUND);
    let location = location_of(&authorize);
    assert!(location.starts_with("https://rp/cb?"));
    assert_eq!(query_param(&location, "state").as_deref(), Some("S"));
    let code = query_param(&location, "code").expect("code in redirect");

    // Redeem the code with the matching verifier.
    let token = server
        .post("/token")
        .form(&[
            ("grant_type", "authorization_code"),
            ("client_id", "c1"),
            ("code", code.as_str()),
            ("redirect_uri", "https://rp/cb"),
            ("code_verifier", CODE_VERIFIER),
        ])
        .await;
    assert_eq!(token.status_code(), StatusCode::OK);
    let body: Value = token.json();
    assert_eq!(body["token_type"], "Bearer");
    let access_token = body["access_token"].as_str().unwrap();
    let id_token = body["id_token"].as_str().unwrap();

    let claims = state
        .key_ring
        .verify(id_token, Some("c1"), &[Algorithm::RS256])
        .await
        .unwrap();
    assert_eq!(claims["sub"], "u1");
    assert_eq!(
        claims["at_hash"].as_str().unwrap(),
        oxauth::app::services::crypto::at_hash(access_token)
    );
    assert!(claims.get("c_hash").is_none());

    // The request_uri was consumed: replaying it fails.
    let (name, value) = cookie_header(&cookie);
    let replayed = server
        .get("/authorize")
        .add_query_param("client_id", "c1")
        .add_query_param("request_uri", &request_uri)
        .add_header(name, value)
        .await;
    assert_eq!(replayed.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn wrong_verifier_is_rejected_without_burning_the_code() {
    let state = test_state().await;
    state.clients.upsert(public_client("c1")).await.unwrap();
    let server = test_server(&state).await;
    let cookie = login_session(&state, "u1").await;

    let (name, value) = cookie_header(&cookie);
    let authorize = server
        .get("/authorize")
        .add_query_param("client_id", "c1")
        .add_query_param("response_type", "code")
        .add_query_param("redirect_uri", "https://rp/cb")
        .add_query_param("scope", "openid")
        .add_query_param("code_challenge", CODE_CHALLENGE)
        .add_query_param("code_challenge_method", "S256")
        .add_header(name, value)
        .await;
    let code = query_param(&location_of(&authorize), "code").unwrap();

    let bad_verifier = "wrong-verifier-wrong-verifier-wrong-verifier-wrong";
    let rejected = server
        .post("/token")
        .form(&[
            ("grant_type", "authorization_code"),
            ("client_id", "c1"),
            ("code", code.as_str()),
            ("redirect_uri", "https://rp/cb"),
            ("code_verifier", bad_verifier),
        ])
        .await;
    assert_eq!(rejected.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = rejected.json();
    assert_eq!(body["error"], "invalid_grant");

    let accepted = server
        .post("/token")
        .form(&[
            ("grant_type", "authorization_code"),
            ("client_id", "c1"),
            ("code", code.as_str()),
            ("redirect_uri", "https://rp/cb"),
            ("code_verifier", CODE_VERIFIER),
        ])
        .await;
    assert_eq!(accepted.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn replayed_code_revokes_the_issued_tokens() {
    let state = test_state().await;
    state.clients.upsert(public_client("c1")).await.unwrap();
    let server = test_server(&state).await;
    let cookie = login_session(&state, "u1").await;

    let (name, value) = cookie_header(&cookie);
    let authorize = server
        .get("/authorize")
        .add_query_param("client_id", "c1")
        .add_query_param("response_type", "code")
        .add_query_param("redirect_uri", "https://rp/cb")
        .add_query_param("scope", "openid")
        .add_header(name, value)
        .await;
    let code = query_param(&location_of(&authorize), "code").unwrap();

    let token_form = [
        ("grant_type", "authorization_code"),
        ("client_id", "c1"),
        ("code", code.as_str()),
        ("redirect_uri", "https://rp/cb"),
    ];
    let first = server.post("/token").form(&token_form).await;
    assert_eq!(first.status_code(), StatusCode::OK);
    let body: Value = first.json();
    let access_token = body["access_token"].as_str().unwrap().to_string();

    // Introspection sees the token active.
    let introspect_form = [("client_id", "c1"), ("token", access_token.as_str())];
    let before: Value = server.post("/introspect").form(&introspect_form).await.json();
    assert_eq!(before["active"], true);

    // Replay: invalid_grant, and the first round's tokens die.
    let replay = server.post("/token").form(&token_form).await;
    assert_eq!(replay.status_code(), StatusCode::BAD_REQUEST);
    let replay_body: Value = replay.json();
    assert_eq!(replay_body["error"], "invalid_grant");

    let after: Value = server.post("/introspect").form(&introspect_form).await.json();
    assert_eq!(after["active"], false);
}

#[tokio::test]
async fn form_post_response_mode_escapes_hostile_state() {
    let state = test_state().await;
    state.clients.upsert(public_client("c1")).await.unwrap();
    let server = test_server(&state).await;
    let cookie = login_session(&state, "u1").await;

    let (name, value) = cookie_header(&cookie);
    let response = server
        .get("/authorize")
        .add_query_param("client_id", "c1")
        .add_query_param("response_type", "code")
        .add_query_param("redirect_uri", "https://rp/cb")
        .add_query_param("scope", "openid")
        .add_query_param("response_mode", "form_post")
        .add_query_param("state", "<script>alert(1)</script>")
        .add_header(name, value)
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let html = response.text();
    assert!(html.contains("<!DOCTYPE html>"));
    assert!(html.contains("value=\"&lt;script&gt;alert(1)&lt;/script&gt;\""));
    assert!(!html.contains("<script>alert(1)</script>"));
    assert!(html.contains("document.getElementById('auth-form').submit()"));
}

#[tokio::test]
async fn fragment_mode_is_rejected_for_code_response_type() {
    let state = test_state().await;
    state.clients.upsert(public_client("c1")).await.unwrap();
    let server = test_server(&state).await;
    let cookie = login_session(&state, "u1").await;

    let (name, value) = cookie_header(&cookie);
    let response = server
        .get("/authorize")
        .add_query_param("client_id", "c1")
        .add_query_param("response_type", "code")
        .add_query_param("redirect_uri", "https://rp/cb")
        .add_query_param("scope", "openid")
        .add_query_param("response_mode", "fragment")
        .add_query_param("state", "S")
        .add_header(name, value)
        .await;

    // The error goes back to the registered redirect.
    assert_eq!(response.status_code(), StatusCode::FOUND);
    let location = location_of(&response);
    assert_eq!(query_param(&location, "error").as_deref(), Some("invalid_request"));
    assert_eq!(query_param(&location, "state").as_deref(), Some("S"));
}

#[tokio::test]
async fn par_endpoint_rejects_non_post() {
    let state = test_state().await;
    let server = test_server(&state).await;
    let response = server.get("/as/par").await;
    assert_eq!(response.status_code(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn unknown_redirect_uri_is_not_redirected_to() {
    let state = test_state().await;
    state.clients.upsert(public_client("c1")).await.unwrap();
    let server = test_server(&state).await;
    let cookie = login_session(&state, "u1").await;

    let (name, value) = cookie_header(&cookie);
    let response = server
        .get("/authorize")
        .add_query_param("client_id", "c1")
        .add_query_param("response_type", "code")
        .add_query_param("redirect_uri", "https://evil.example/cb")
        .add_query_param("scope", "openid")
        .add_header(name, value)
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn authorize_without_session_suspends_to_login() {
    let state = test_state().await;
    state.clients.upsert(public_client("c1")).await.unwrap();
    let server = test_server(&state).await;

    let response = server
        .get("/authorize")
        .add_query_param("client_id", "c1")
        .add_query_param("response_type", "code")
        .add_query_param("redirect_uri", "https://rp/cb")
        .add_query_param("scope", "openid")
        .await;
    assert_eq!(response.status_code(), StatusCode::FOUND);
    let location = location_of(&response);
    assert!(location.contains("/login?challenge_id="));
    let challenge_id = query_param(&location, "challenge_id").unwrap();

    // The login UI posts back; the flow resumes and mints a code.
    let resumed = server
        .post("/authorize/resume")
        .form(&[
            ("challenge_id", challenge_id.as_str()),
            ("user_id", "u42"),
            ("amr", "pwd otp"),
        ])
        .await;
    assert_eq!(resumed.status_code(), StatusCode::FOUND);
    let location = location_of(&resumed);
    assert!(query_param(&location, "code").is_some());

    // Challenges are single-use.
    let replayed = server
        .post("/authorize/resume")
        .form(&[("challenge_id", challenge_id.as_str()), ("user_id", "u42")])
        .await;
    assert_eq!(replayed.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn prompt_none_without_session_reports_login_required() {
    let state = test_state().await;
    state.clients.upsert(public_client("c1")).await.unwrap();
    let server = test_server(&state).await;

    let response = server
        .get("/authorize")
        .add_query_param("client_id", "c1")
        .add_query_param("response_type", "code")
        .add_query_param("redirect_uri", "https://rp/cb")
        .add_query_param("scope", "openid")
        .add_query_param("prompt", "none")
        .await;
    assert_eq!(response.status_code(), StatusCode::FOUND);
    let location = location_of(&response);
    assert_eq!(query_param(&location, "error").as_deref(), Some("login_required"));
}

#[tokio::test]
async fn discovery_document_advertises_core_capabilities() {
    let state = test_state().await;
    let server = test_server(&state).await;

    let body: Value = server.get("/.well-known/openid-configuration").await.json();
    assert_eq!(body["issuer"], state.issuer.as_str());
    let modes: Vec<&str> = body["response_modes_supported"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(modes.contains(&"query"));
    assert!(modes.contains(&"form_post"));
    assert!(body["code_challenge_methods_supported"]
        .as_array()
        .unwrap()
        .iter()
        .any(|v| v == "S256"));

    let jwks: Value = server.get("/.well-known/jwks.json").await.json();
    assert!(!jwks["keys"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unsigned_request_objects_follow_the_none_alg_policy() {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

    let state = test_state().await;
    state.clients.upsert(public_client("c1")).await.unwrap();
    let server = test_server(&state).await;
    let cookie = login_session(&state, "u1").await;

    let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&serde_json::json!({"alg": "none"})).unwrap());
    let payload = URL_SAFE_NO_PAD.encode(
        serde_json::to_vec(&serde_json::json!({
            "iss": "c1",
            "client_id": "c1",
            "response_type": "code",
            "redirect_uri": "https://rp/cb",
            "scope": "openid",
            "state": "S",
        }))
        .unwrap(),
    );
    let request_object = format!("{}.{}.", header, payload);

    // Default policy rejects alg=none outright.
    let (name, value) = cookie_header(&cookie);
    let rejected = server
        .get("/authorize")
        .add_query_param("client_id", "c1")
        .add_query_param("request", &request_object)
        .add_header(name, value)
        .await;
    assert_eq!(rejected.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = rejected.json();
    assert_eq!(body["error"], "invalid_request_object");

    // Outside production, an explicit opt-in admits it.
    state
        .resolver
        .set("oauth.allow_none_algorithm", serde_json::json!(true))
        .await
        .unwrap();
    let (name, value) = cookie_header(&cookie);
    let accepted = server
        .get("/authorize")
        .add_query_param("client_id", "c1")
        .add_query_param("request", &request_object)
        .add_header(name, value)
        .await;
    assert_eq!(accepted.status_code(), StatusCode::FOUND);
    let location = location_of(&accepted);
    assert!(query_param(&location, "code").is_some());
    assert_eq!(query_param(&location, "state").as_deref(), Some("S"));
}

#[tokio::test]
async fn rate_limit_headers_are_consistent() {
    let state = test_state().await;
    state.clients.upsert(public_client("c1")).await.unwrap();
    let server = test_server(&state).await;

    let response = server
        .post("/token")
        .add_header(
            HeaderName::from_static("x-forwarded-for"),
            HeaderValue::from_static("203.0.113.50"),
        )
        .form(&[("grant_type", "authorization_code"), ("client_id", "c1")])
        .await;

    let limit: u32 = response
        .headers()
        .get("x-ratelimit-limit")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    let remaining: u32 = response
        .headers()
        .get("x-ratelimit-remaining")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    let reset: i64 = response
        .headers()
        .get("x-ratelimit-reset")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();

    // First request in the window: remaining == limit - 1.
    assert_eq!(remaining, limit - 1);
    let now = chrono::Utc::now().timestamp();
    assert!(reset >= now);
    assert!(reset <= now + 60);
}
