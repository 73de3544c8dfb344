// Engine adapter trait shared by the relational store and the analytical engine
use crate::api::middleware::AppError;
use crate::models::{CellValue, Row, TableKey};
use std::sync::Arc;

/// Query execution result
///
/// Rows sit behind an `Arc` so cached results are handed out without copying.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub rows: Arc<Vec<Row>>,
    pub row_count: usize,
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn new(rows: Vec<Row>, execution_time_ms: u64) -> Self {
        Self {
            row_count: rows.len(),
            rows: Arc::new(rows),
            execution_time_ms,
        }
    }

    /// Column names of the first row, or nothing for an empty result
    pub fn columns(&self) -> Vec<String> {
        self.rows
            .first()
            .map(Row::column_names)
            .unwrap_or_default()
    }

    /// Restrict every row to `columns`, in the order given.
    pub fn project(&self, columns: &[String]) -> Result<QueryResult, AppError> {
        let rows = self
            .rows
            .iter()
            .map(|row| row.project(columns))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|missing| AppError::InvalidInput(format!("Unknown column: {}", missing)))?;

        Ok(QueryResult {
            row_count: rows.len(),
            rows: Arc::new(rows),
            execution_time_ms: self.execution_time_ms,
        })
    }
}

/// Database adapter trait - abstraction over the engines the execution layer
/// fronts. Adapters classify their own failures into the `AppError` taxonomy.
#[async_trait::async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Execute a parameterized statement
    async fn execute_query(
        &self,
        sql: &str,
        params: &[CellValue],
        timeout_secs: u64,
    ) -> Result<QueryResult, AppError>;

    /// Read every row of one table
    async fn read_table(&self, key: &TableKey, timeout_secs: u64) -> Result<QueryResult, AppError>;

    /// Get database type
    fn database_type(&self) -> &str;

    /// Test connection
    async fn test_connection(&self) -> Result<(), AppError>;
}
