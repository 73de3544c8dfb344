use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifies one table snapshot: where it is stored, its namespace and its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableKey {
    pub location: String,
    pub namespace: String,
    pub table: String,
}

impl TableKey {
    pub fn new(
        location: impl Into<String>,
        namespace: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            location: location.into(),
            namespace: namespace.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.location, self.namespace, self.table)
    }
}

/// Per-call options for a whole-table read
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOptions {
    /// Youngest snapshot the caller accepts; `None` uses the cache default.
    pub max_age: Option<Duration>,
    /// Skip any cached snapshot and read from the engine.
    pub force_refresh: bool,
    /// When false the snapshot cache is neither consulted nor populated.
    pub use_cache: bool,
    /// Projection applied to the returned rows.
    pub columns: Option<Vec<String>>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            max_age: None,
            force_refresh: false,
            use_cache: true,
            columns: None,
        }
    }
}

fn default_use_cache() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableReadRequest {
    /// Storage location; falls back to the configured warehouse
    pub location: Option<String>,
    pub namespace: String,
    pub table: String,
    pub max_age_secs: Option<u64>,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    pub columns: Option<Vec<String>>,
}

impl TableReadRequest {
    pub fn options(&self) -> ReadOptions {
        ReadOptions {
            max_age: self.max_age_secs.map(Duration::from_secs),
            force_refresh: self.force_refresh,
            use_cache: self.use_cache,
            columns: self.columns.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_key_display() {
        let key = TableKey::new("s3://bucket", "sales", "orders");
        assert_eq!(key.to_string(), "s3://bucket:sales:orders");
    }

    #[test]
    fn test_read_request_defaults() {
        let request: TableReadRequest =
            serde_json::from_str(r#"{"namespace": "sales", "table": "orders"}"#).unwrap();
        let options = request.options();
        assert!(options.use_cache);
        assert!(!options.force_refresh);
        assert_eq!(options.max_age, None);
        assert!(request.location.is_none());
    }

    #[test]
    fn test_read_request_options() {
        let request: TableReadRequest = serde_json::from_str(
            r#"{"namespace": "sales", "table": "orders", "max_age_secs": 5, "force_refresh": true, "columns": ["id"]}"#,
        )
        .unwrap();
        let options = request.options();
        assert_eq!(options.max_age, Some(Duration::from_secs(5)));
        assert!(options.force_refresh);
        assert_eq!(options.columns, Some(vec!["id".to_string()]));
    }
}
