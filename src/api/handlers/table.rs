use axum::{extract::State, Json};

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::{QueryResponse, TableReadRequest};

/// Read a whole table through the snapshot cache
pub async fn read_table(
    State(state): State<AppState>,
    Json(payload): Json<TableReadRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    if payload.namespace.trim().is_empty() || payload.table.trim().is_empty() {
        return Err(AppError::Validation(
            "Namespace and table are required".to_string(),
        ));
    }

    let location = payload
        .location
        .as_deref()
        .unwrap_or(&state.config.warehouse.path);

    tracing::info!(
        "Reading table {}:{}:{} (force_refresh: {}, use_cache: {})",
        location,
        payload.namespace,
        payload.table,
        payload.force_refresh,
        payload.use_cache
    );

    let outcome = state
        .execution
        .read_table(location, &payload.namespace, &payload.table, payload.options())
        .await?;

    Ok(Json(QueryResponse::new(
        outcome.cache_key,
        outcome.cached,
        outcome.result.rows,
        outcome.result.execution_time_ms,
    )))
}
