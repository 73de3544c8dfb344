use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{cache, health, query, table, AppState};

/// Create router with application state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/query", post(query::execute_query))
        .route("/api/tables/read", post(table::read_table))
        .route("/api/cache/invalidate", post(cache::invalidate))
        .route("/api/metrics", get(cache::metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
