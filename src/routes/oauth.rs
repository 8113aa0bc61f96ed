use axum::routing::{get, post};
use axum::Router;

use crate::app::http::controllers::{
    authorization_controller, ciba_controller, device_controller, discovery_controller,
    flow_controller, introspection_controller, par_controller, token_controller,
    userinfo_controller,
};
use crate::app::state::AppState;

/// Protocol endpoints. Method routing answers 405 for the wrong verb, which
/// is exactly what PAR requires for non-POST.
pub fn oauth_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/.well-known/openid-configuration",
            get(discovery_controller::openid_configuration),
        )
        .route("/.well-known/jwks.json", get(discovery_controller::jwks))
        .route("/as/par", post(par_controller::push))
        .route(
            "/authorize",
            get(authorization_controller::authorize_get)
                .post(authorization_controller::authorize_post),
        )
        .route("/authorize/resume", post(authorization_controller::resume))
        .route("/token", post(token_controller::token))
        .route("/introspect", post(introspection_controller::introspect))
        .route("/revoke", post(introspection_controller::revoke))
        .route("/userinfo", get(userinfo_controller::userinfo))
        .route(
            "/device_authorization",
            post(device_controller::device_authorization),
        )
        .route("/device/data", get(device_controller::verification_data))
        .route("/device/verify", post(device_controller::verify))
        .route("/bc-authorize", post(ciba_controller::bc_authorize))
        .route(
            "/bc-authorize/{auth_req_id}/complete",
            post(ciba_controller::complete),
        )
        .route(
            "/bc-authorize/{auth_req_id}/status",
            get(ciba_controller::status),
        )
        .route("/flow/{flow_id}/start", post(flow_controller::start))
        .route("/flow/submit", post(flow_controller::submit))
}
