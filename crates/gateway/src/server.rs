//! HTTP router assembly.

use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::session::{message_handler, sse_handler};
use crate::state::AppState;

/// Build the gateway router. `/health` is unauthenticated for probes;
/// everything else goes through the scope endpoints.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/:scope/sse", get(sse_handler).post(message_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": state.sessions.len().await,
    }))
}
