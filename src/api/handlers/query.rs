use axum::{extract::State, Json};

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::{QueryRequest, QueryResponse};

/// Execute a parameterized query through the result cache
pub async fn execute_query(
    State(state): State<AppState>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    // Sanitize SQL query input
    let query = payload.query.trim();
    if query.is_empty() {
        return Err(AppError::Validation("SQL query cannot be empty".to_string()));
    }

    tracing::info!("Executing query with {} parameters", payload.params.len());

    let outcome = state.execution.execute_query(query, &payload.params).await?;

    Ok(Json(QueryResponse::new(
        outcome.cache_key,
        outcome.cached,
        outcome.result.rows,
        outcome.result.execution_time_ms,
    )))
}
