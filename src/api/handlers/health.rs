use axum::{extract::State, http::StatusCode, Json};

use crate::api::handlers::AppState;
use crate::services::execution::{HealthReport, HealthStatus};

/// Liveness plus breaker, pool and cache state; 503 when the engine is unreachable
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.execution.health_check().await;
    let status = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report))
}
