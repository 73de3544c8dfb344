// Engine adapters behind the execution layer
pub mod adapter;
pub mod analytical;
pub mod converter;
pub mod postgresql;

pub use adapter::{DatabaseAdapter, QueryResult};
pub use analytical::{AnalyticalAdapter, AnalyticalConfig};
pub use postgresql::PostgreSQLAdapter;

use crate::api::middleware::AppError;
use crate::services::connection_pool::MonitoredPool;
use crate::services::pool_monitor::PoolEventListener;
use std::sync::Arc;

/// Build a pooled PostgreSQL adapter whose pool reports to `listener`
pub fn create_postgres_adapter(
    connection_url: &str,
    pool_size: usize,
    listener: Arc<dyn PoolEventListener>,
) -> Result<(Arc<PostgreSQLAdapter>, Arc<MonitoredPool>), AppError> {
    let pool = Arc::new(MonitoredPool::new(connection_url, pool_size, listener)?);
    let adapter = Arc::new(PostgreSQLAdapter::new(pool.clone())?);
    Ok((adapter, pool))
}
