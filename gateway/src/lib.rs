//! Edge relay between browser sessions and the single processing worker.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod registry;
pub mod relay;
pub mod state;
pub mod supervisor;
pub mod transcripts;
pub mod upload;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

pub use state::AppState;

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(origin = %origin, error = %e, "ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::AUTHORIZATION])
        .max_age(std::time::Duration::from_secs(3600))
}

pub fn router(state: Arc<AppState>) -> Router {
    let max_upload = state.config.max_upload_bytes;
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .route("/health", get(api::health))
        .route("/status", get(api::status))
        .route("/ws/worker", get(supervisor::worker_websocket))
        .route("/ws/session", get(supervisor::session_websocket))
        .route("/ws/web", get(supervisor::session_websocket))
        .route(
            "/upload",
            post(upload::upload_document).layer(DefaultBodyLimit::max(max_upload)),
        )
        .route("/chats", get(api::list_chats))
        .route("/chats/{chat_id}", get(api::get_chat).put(api::put_chat))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
