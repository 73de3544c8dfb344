use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::row::{CellValue, Row};

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    /// Positional parameters, bound in order
    #[serde(default)]
    pub params: Vec<CellValue>,
}

/// Response body shared by query execution and table reads
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub id: String,
    /// Cache key the result was stored under
    pub fingerprint: String,
    pub cached: bool,
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub rows: Arc<Vec<Row>>,
}

impl QueryResponse {
    pub fn new(
        fingerprint: String,
        cached: bool,
        rows: Arc<Vec<Row>>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            fingerprint,
            cached,
            row_count: rows.len(),
            execution_time_ms,
            rows,
        }
    }
}

/// What to drop from the caches
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum InvalidationScope {
    /// Both caches, every entry
    All,
    /// Every query result
    Results,
    /// Every table snapshot
    Snapshots,
    Fingerprint {
        fingerprint: String,
    },
    Query {
        query: String,
        #[serde(default)]
        params: Vec<CellValue>,
    },
    Table {
        location: String,
        namespace: String,
        table: String,
    },
    /// Every snapshot whose table name contains `table`, under any location or namespace
    TableName {
        table: String,
    },
}
