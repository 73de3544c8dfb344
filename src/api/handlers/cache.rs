use axum::{extract::State, Json};
use serde::Serialize;

use crate::api::handlers::AppState;
use crate::models::InvalidationScope;
use crate::services::execution::CacheSnapshot;
use crate::services::metrics::MetricsSnapshot;
use crate::services::pool_monitor::PoolSnapshot;

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub invalidated: usize,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub metrics: MetricsSnapshot,
    pub pool: PoolSnapshot,
    pub cache: CacheSnapshot,
}

/// Drop cached results and/or table snapshots
pub async fn invalidate(
    State(state): State<AppState>,
    Json(scope): Json<InvalidationScope>,
) -> Json<InvalidateResponse> {
    let invalidated = state.execution.invalidate(&scope);
    Json(InvalidateResponse { invalidated })
}

pub async fn metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        metrics: state.execution.metrics().snapshot(),
        pool: state.execution.pool_monitor().snapshot(),
        cache: state.execution.cache_snapshot(),
    })
}
