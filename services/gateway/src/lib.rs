pub mod admin_events;
pub mod auth;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod errors;
pub mod heartbeat;
pub mod http;
pub mod presence;
pub mod repo;
pub mod resolver;
pub mod session;
pub mod state;
pub mod ws_handler;

pub use state::AppState;

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler::ws_upgrade_handler))
        .route("/healthz", get(http::health::healthz))
        .route("/readyz", get(http::health::readyz))
        .route("/api/v1/metrics", get(http::metrics::get_metrics))
        .route("/api/v1/admin/sessions", get(http::admin::list_sessions))
        .route("/api/v1/admin/events", get(http::sse::admin_events))
        .fallback(fallback_404)
        .with_state(state)
}

async fn fallback_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Html("<h1>404 Not Found</h1>"))
}
