// Analytical engine adapter
//
// Runs SQL through a DataFusion session and reads whole tables from Parquet
// directories laid out as `<location>/<namespace>/<table>/`.

use anyhow::Context;
use datafusion::error::DataFusionError;
use datafusion::prelude::*;
use datafusion::scalar::ScalarValue;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::api::middleware::AppError;
use crate::models::{CellValue, TableKey};
use crate::services::database::adapter::{DatabaseAdapter, QueryResult};
use crate::services::database::converter::batches_to_rows;

/// Configuration for the DataFusion session
#[derive(Debug, Clone)]
pub struct AnalyticalConfig {
    /// Batch size for query execution
    pub batch_size: usize,
    /// Number of partitions for parallel execution
    pub target_partitions: usize,
}

impl Default for AnalyticalConfig {
    fn default() -> Self {
        Self {
            batch_size: 8192,
            target_partitions: num_cpus::get(),
        }
    }
}

pub struct AnalyticalAdapter {
    ctx: SessionContext,
}

impl AnalyticalAdapter {
    pub fn new(config: AnalyticalConfig) -> Self {
        let session_config = SessionConfig::new()
            .with_batch_size(config.batch_size)
            .with_target_partitions(config.target_partitions);

        Self {
            ctx: SessionContext::new_with_config(session_config),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Expose a Parquet table directory to SQL under `name`
    pub async fn register_table(&self, name: &str, key: &TableKey) -> Result<(), AppError> {
        let path = Self::table_path(key)?;
        self.ctx
            .register_parquet(name, &path, ParquetReadOptions::default())
            .await
            .map_err(Self::classify_error)?;
        tracing::info!("Registered table '{}' from {}", name, path);
        Ok(())
    }

    /// Register every `<namespace>/<table>/` directory under `root` as `namespace.table`.
    ///
    /// Only lowercase identifier names are picked up. A table that fails to
    /// register is logged and skipped.
    pub async fn register_warehouse(&self, root: &str) -> Result<usize, AppError> {
        let mut namespaces = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Warehouse directory {} does not exist", root);
                return Ok(0);
            }
            Err(e) => return Err(AppError::classify(format!("Failed to read warehouse {}: {}", root, e))),
        };

        let mut registered = 0;
        while let Some(namespace) = Self::next_dir(&mut namespaces).await? {
            self.ctx
                .sql(&format!("CREATE SCHEMA IF NOT EXISTS {}", namespace))
                .await
                .map_err(Self::classify_error)?;

            let ns_path: PathBuf = [root, namespace.as_str()].iter().collect();
            let mut tables = tokio::fs::read_dir(&ns_path)
                .await
                .map_err(|e| AppError::classify(format!("Failed to read {}: {}", ns_path.display(), e)))?;

            while let Some(table) = Self::next_dir(&mut tables).await? {
                let key = TableKey::new(root, namespace.as_str(), table.as_str());
                match self.register_table(&format!("{}.{}", namespace, table), &key).await {
                    Ok(()) => registered += 1,
                    Err(e) => tracing::warn!("Skipping table {}: {}", key, e),
                }
            }
        }

        tracing::info!("Registered {} warehouse tables from {}", registered, root);
        Ok(registered)
    }

    /// Next subdirectory whose name is a plain lowercase identifier
    async fn next_dir(entries: &mut tokio::fs::ReadDir) -> Result<Option<String>, AppError> {
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|e| AppError::classify(format!("Failed to list directory: {}", e)))?;
            let Some(entry) = entry else {
                return Ok(None);
            };
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            let plain = name.starts_with(|c: char| c.is_ascii_lowercase() || c == '_')
                && name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
            if is_dir && plain {
                return Ok(Some(name));
            }
        }
    }

    fn table_path(key: &TableKey) -> Result<String, AppError> {
        for part in [&key.namespace, &key.table] {
            if part.is_empty() || part.contains("..") || part.contains('/') || part.contains('\\') {
                return Err(AppError::InvalidInput(format!("Invalid table path component: '{}'", part)));
            }
        }
        let path: PathBuf = [key.location.as_str(), key.namespace.as_str(), key.table.as_str()]
            .iter()
            .collect();
        Ok(format!("{}/", path.display()))
    }

    fn to_scalar(value: &CellValue) -> ScalarValue {
        match value {
            CellValue::Null => ScalarValue::Null,
            CellValue::Bool(b) => ScalarValue::Boolean(Some(*b)),
            CellValue::Int(i) => ScalarValue::Int64(Some(*i)),
            CellValue::Float(f) => ScalarValue::Float64(Some(*f)),
            CellValue::Text(s) => ScalarValue::Utf8(Some(s.clone())),
            CellValue::Nested(v) => ScalarValue::Utf8(Some(v.to_string())),
        }
    }

    async fn collect(&self, df: DataFrame, start: Instant) -> Result<QueryResult, AppError> {
        let batches = df.collect().await.map_err(Self::classify_error)?;
        let rows = batches_to_rows(&batches).context("Failed to convert results")?;
        Ok(QueryResult::new(rows, start.elapsed().as_millis() as u64))
    }

    /// Map a DataFusion error onto the execution taxonomy
    fn classify_error(err: DataFusionError) -> AppError {
        let message = err.to_string();
        match err.find_root() {
            DataFusionError::SQL(..)
            | DataFusionError::Plan(..)
            | DataFusionError::SchemaError(..)
            | DataFusionError::NotImplemented(..) => AppError::InvalidInput(message),
            DataFusionError::IoError(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
                AppError::PermissionDenied(message)
            }
            DataFusionError::IoError(io) if io.kind() == std::io::ErrorKind::NotFound => {
                AppError::InvalidInput(message)
            }
            DataFusionError::IoError(..) | DataFusionError::ObjectStore(..) => {
                if message.to_lowercase().contains("not found") {
                    AppError::InvalidInput(message)
                } else {
                    AppError::Connection(message)
                }
            }
            _ => AppError::classify(message),
        }
    }
}

impl Default for AnalyticalAdapter {
    fn default() -> Self {
        Self::new(AnalyticalConfig::default())
    }
}

#[async_trait::async_trait]
impl DatabaseAdapter for AnalyticalAdapter {
    async fn execute_query(
        &self,
        sql: &str,
        params: &[CellValue],
        timeout_secs: u64,
    ) -> Result<QueryResult, AppError> {
        let start = Instant::now();
        let work = async {
            let mut df = self.ctx.sql(sql).await.map_err(Self::classify_error)?;
            if !params.is_empty() {
                let values: Vec<ScalarValue> = params.iter().map(Self::to_scalar).collect();
                df = df.with_param_values(values).map_err(Self::classify_error)?;
            }
            self.collect(df, start).await
        };

        tokio::time::timeout(Duration::from_secs(timeout_secs), work)
            .await
            .map_err(|_| AppError::Connection(format!("Query timeout after {} seconds", timeout_secs)))?
    }

    async fn read_table(&self, key: &TableKey, timeout_secs: u64) -> Result<QueryResult, AppError> {
        let path = Self::table_path(key)?;
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| AppError::classify(format!("Failed to access {}: {}", path, e)))?;
        if !exists {
            return Err(AppError::InvalidInput(format!("Table not found: {}", key)));
        }

        let start = Instant::now();
        let work = async {
            let df = self
                .ctx
                .read_parquet(path.as_str(), ParquetReadOptions::default())
                .await
                .map_err(Self::classify_error)?;
            self.collect(df, start).await
        };

        tokio::time::timeout(Duration::from_secs(timeout_secs), work)
            .await
            .map_err(|_| AppError::Connection(format!("Table read timeout after {} seconds", timeout_secs)))?
    }

    fn database_type(&self) -> &str {
        "datafusion"
    }

    async fn test_connection(&self) -> Result<(), AppError> {
        self.execute_query("SELECT 1", &[], 5).await.map(|_| ())
    }
}
