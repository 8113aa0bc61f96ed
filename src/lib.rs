pub mod actor;
pub mod app;
pub mod config;
pub mod kv;
pub mod routes;

use axum::middleware;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use app::state::AppState;

pub async fn create_app() -> anyhow::Result<Router> {
    let config = config::Config::from_env()?;
    let state = AppState::build(config).await?;
    Ok(create_app_with_state(state))
}

pub fn create_app_with_state(state: AppState) -> Router {
    Router::new()
        .merge(routes::oauth::oauth_routes())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app::http::middleware::rate_limit,
        ))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
