// PostgreSQL adapter using connection pooling for optimal resource management
use crate::api::middleware::AppError;
use crate::models::{CellValue, Row, TableKey};
use crate::services::connection_pool::MonitoredPool;
use crate::services::database::adapter::{DatabaseAdapter, QueryResult};
use std::error::Error as StdError;
use std::num::TryFromIntError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_postgres::types::{ToSql, Type, WrongType};
use url::Url;

pub struct PostgreSQLAdapter {
    pool: Arc<MonitoredPool>,
}

impl PostgreSQLAdapter {
    pub fn new(pool: Arc<MonitoredPool>) -> Result<Self, AppError> {
        // Validate PostgreSQL URL format
        let url = Url::parse(pool.connection_url())
            .map_err(|e| AppError::Validation(format!("Invalid PostgreSQL URL: {}", e)))?;

        if url.scheme() != "postgresql" && url.scheme() != "postgres" {
            return Err(AppError::Validation(
                "URL must use postgresql:// or postgres:// scheme".to_string(),
            ));
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Arc<MonitoredPool> {
        &self.pool
    }

    async fn run(&self, sql: &str, params: &[CellValue], timeout_secs: u64) -> Result<QueryResult, AppError> {
        let start_time = Instant::now();

        // Checkout is inside the timeout so an unreachable server cannot outlast it
        let work = async {
            let client = self.pool.checkout().await?;
            let statement = client.prepare_cached(sql).await.map_err(Self::classify_error)?;
            let bound = Self::bind_params(params, statement.params())?;
            let refs: Vec<&(dyn ToSql + Sync)> = bound
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            client
                .query(&statement, &refs)
                .await
                .map_err(Self::classify_error)
        };

        let rows = tokio::time::timeout(Duration::from_secs(timeout_secs), work)
            .await
            .map_err(|_| AppError::Connection(format!("Query timeout after {} seconds", timeout_secs)))??;

        let rows = rows.iter().map(Self::convert_row).collect::<Vec<_>>();
        Ok(QueryResult::new(rows, start_time.elapsed().as_millis() as u64))
    }

    /// Bind each parameter to the type the server inferred for its placeholder
    fn bind_params(params: &[CellValue], types: &[Type]) -> Result<Vec<Box<dyn ToSql + Sync + Send>>, AppError> {
        params
            .iter()
            .zip(types.iter().chain(std::iter::repeat(&Type::TEXT)))
            .enumerate()
            .map(|(idx, (value, ty))| Self::to_sql(value, ty).map_err(|e| {
                AppError::InvalidInput(format!("Parameter ${} does not fit {}: {}", idx + 1, ty, e))
            }))
            .collect()
    }

    fn to_sql(value: &CellValue, ty: &Type) -> Result<Box<dyn ToSql + Sync + Send>, TryFromIntError> {
        let bound: Box<dyn ToSql + Sync + Send> = match (value, ty) {
            (CellValue::Null, &Type::INT2) => Box::new(None::<i16>),
            (CellValue::Null, &Type::INT4) => Box::new(None::<i32>),
            (CellValue::Null, &Type::INT8) => Box::new(None::<i64>),
            (CellValue::Null, &Type::FLOAT4) => Box::new(None::<f32>),
            (CellValue::Null, &Type::FLOAT8) => Box::new(None::<f64>),
            (CellValue::Null, &Type::BOOL) => Box::new(None::<bool>),
            (CellValue::Null, &Type::JSON) | (CellValue::Null, &Type::JSONB) => {
                Box::new(None::<serde_json::Value>)
            }
            (CellValue::Null, _) => Box::new(None::<String>),
            (CellValue::Bool(b), _) => Box::new(*b),
            (CellValue::Int(i), &Type::INT2) => Box::new(i16::try_from(*i)?),
            (CellValue::Int(i), &Type::INT4) => Box::new(i32::try_from(*i)?),
            (CellValue::Int(i), &Type::FLOAT4) => Box::new(*i as f32),
            (CellValue::Int(i), &Type::FLOAT8) => Box::new(*i as f64),
            (CellValue::Int(i), &Type::TEXT) | (CellValue::Int(i), &Type::VARCHAR) => {
                Box::new(i.to_string())
            }
            (CellValue::Int(i), _) => Box::new(*i),
            (CellValue::Float(f), &Type::FLOAT4) => Box::new(*f as f32),
            (CellValue::Float(f), &Type::TEXT) | (CellValue::Float(f), &Type::VARCHAR) => {
                Box::new(f.to_string())
            }
            (CellValue::Float(f), _) => Box::new(*f),
            (CellValue::Text(s), _) => Box::new(s.clone()),
            (CellValue::Nested(v), &Type::JSON) | (CellValue::Nested(v), &Type::JSONB) => {
                Box::new(v.clone())
            }
            (CellValue::Nested(v), _) => Box::new(v.to_string()),
        };
        Ok(bound)
    }

    fn convert_row(row: &tokio_postgres::Row) -> Row {
        let mut converted = Row::with_capacity(row.len());
        for (idx, column) in row.columns().iter().enumerate() {
            let value = match *column.type_() {
                Type::BOOL => row
                    .try_get::<_, Option<bool>>(idx)
                    .ok()
                    .flatten()
                    .map(CellValue::Bool),
                Type::INT2 => row
                    .try_get::<_, Option<i16>>(idx)
                    .ok()
                    .flatten()
                    .map(|v| CellValue::Int(v as i64)),
                Type::INT4 => row
                    .try_get::<_, Option<i32>>(idx)
                    .ok()
                    .flatten()
                    .map(|v| CellValue::Int(v as i64)),
                Type::INT8 => row
                    .try_get::<_, Option<i64>>(idx)
                    .ok()
                    .flatten()
                    .map(CellValue::Int),
                Type::FLOAT4 => row
                    .try_get::<_, Option<f32>>(idx)
                    .ok()
                    .flatten()
                    .map(|v| CellValue::Float(v as f64)),
                Type::FLOAT8 => row
                    .try_get::<_, Option<f64>>(idx)
                    .ok()
                    .flatten()
                    .map(CellValue::Float),
                Type::JSON | Type::JSONB => row
                    .try_get::<_, Option<serde_json::Value>>(idx)
                    .ok()
                    .flatten()
                    .map(CellValue::Nested),
                Type::TIMESTAMPTZ => row
                    .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
                    .ok()
                    .flatten()
                    .map(|v| CellValue::Text(v.to_rfc3339())),
                Type::TIMESTAMP => row
                    .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
                    .ok()
                    .flatten()
                    .map(|v| CellValue::Text(v.to_string())),
                Type::DATE => row
                    .try_get::<_, Option<chrono::NaiveDate>>(idx)
                    .ok()
                    .flatten()
                    .map(|v| CellValue::Text(v.format("%Y-%m-%d").to_string())),
                _ => match row.try_get::<_, Option<String>>(idx) {
                    Ok(v) => v.map(CellValue::Text),
                    // For types that can't be converted to string,
                    // show the type name as placeholder
                    Err(_) => Some(CellValue::Text(format!("<{}>", column.type_().name()))),
                },
            };
            converted.push(column.name(), value.unwrap_or(CellValue::Null));
        }
        converted
    }

    /// Map a driver error onto the execution taxonomy
    fn classify_error(e: tokio_postgres::Error) -> AppError {
        let Some(db_error) = e.as_db_error() else {
            return Self::classify_client_error(e.is_closed(), e.source(), e.to_string());
        };

        let code = db_error.code().code();
        let message = format!("Code: {}, Message: {}", code, db_error.message());
        match code {
            "42501" => AppError::PermissionDenied(message),
            c if c.starts_with("28") => AppError::PermissionDenied(message),
            c if c.starts_with("08") || c.starts_with("57P") || c.starts_with("53") => {
                AppError::Connection(message)
            }
            c if c.starts_with("42") || c.starts_with("22") => AppError::InvalidInput(message),
            _ => AppError::classify(message),
        }
    }

    /// Errors raised before or without a server response
    fn classify_client_error(closed: bool, source: Option<&(dyn StdError + 'static)>, message: String) -> AppError {
        let message = format!("Query execution failed: {}", message);
        match source {
            _ if closed => AppError::Connection(message),
            Some(src) if src.is::<std::io::Error>() => AppError::Connection(message),
            // Parameter encoding: the value does not match the placeholder type
            Some(src) if src.is::<WrongType>() || src.is::<TryFromIntError>() => {
                AppError::InvalidInput(format!("{}: {}", message, src))
            }
            _ => AppError::classify(message),
        }
    }

    fn quote_ident(ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

#[async_trait::async_trait]
impl DatabaseAdapter for PostgreSQLAdapter {
    async fn execute_query(
        &self,
        sql: &str,
        params: &[CellValue],
        timeout_secs: u64,
    ) -> Result<QueryResult, AppError> {
        self.run(sql, params, timeout_secs).await
    }

    async fn read_table(&self, key: &TableKey, timeout_secs: u64) -> Result<QueryResult, AppError> {
        let sql = format!(
            "SELECT * FROM {}.{}",
            Self::quote_ident(&key.namespace),
            Self::quote_ident(&key.table)
        );
        self.run(&sql, &[], timeout_secs).await
    }

    fn database_type(&self) -> &str {
        "postgresql"
    }

    async fn test_connection(&self) -> Result<(), AppError> {
        let client = self.pool.checkout().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(Self::classify_error)?;
        Ok(())
    }
}
