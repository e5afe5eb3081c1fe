pub mod error;
pub mod rest;

use axum::routing::{get, post};
use axum::Router;
use sentinel_sdk::Engine;
use std::sync::Arc;

pub use error::ApiError;

pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/events", post(rest::api_submit_event))
        .route("/api/narratives", get(rest::api_narratives))
        .route("/api/narratives/{id}", get(rest::api_narrative_detail))
        .route("/api/narratives/{id}/origin", get(rest::api_narrative_origin))
        .route("/api/bots", get(rest::api_bots))
        .route("/api/communities", get(rest::api_communities))
        .route("/api/stats", get(rest::api_stats))
        .route("/api/users/{handle}", get(rest::api_user))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        // method and path only, no query strings
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        )
}
