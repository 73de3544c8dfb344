// Execution Service
//
// The single call path for every engine operation: fingerprint, cache lookup,
// breaker-gated retried engine call on a miss, cache population and metrics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::api::middleware::{AppError, ErrorKind};
use crate::config::Config;
use crate::models::{CellValue, InvalidationScope, ReadOptions, TableKey};
use crate::services::circuit_breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use crate::services::clock::{system_clock, Clock};
use crate::services::database::adapter::{DatabaseAdapter, QueryResult};
use crate::services::metrics::{ExecutionMetrics, MetricsSnapshot};
use crate::services::pool_monitor::{PoolMonitor, PoolSnapshot};
use crate::services::query_cache::{CacheStats, QueryResultCache};
use crate::services::retry::{GuardedOperation, RetryPolicy};
use crate::services::snapshot_cache::{SnapshotCacheConfig, SnapshotInfo, SnapshotStats, TableSnapshotCache};

pub const EXECUTE_QUERY: &str = "execute_query";
pub const READ_TABLE: &str = "read_table";
pub const HEALTH_CHECK: &str = "health_check";

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub query_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub result_ttl: Duration,
    pub result_max_entries: usize,
    pub snapshots: SnapshotCacheConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            query_timeout_secs: 300,
            health_timeout_secs: 5,
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            result_ttl: Duration::from_secs(300),
            result_max_entries: 1000,
            snapshots: SnapshotCacheConfig::default(),
        }
    }
}

impl From<&Config> for ExecutionConfig {
    fn from(config: &Config) -> Self {
        Self {
            query_timeout_secs: config.query.timeout_secs,
            health_timeout_secs: config.query.timeout_secs.min(5),
            retry: RetryPolicy::new(
                config.retry.max_attempts,
                Duration::from_millis(config.retry.base_delay_ms),
                Duration::from_millis(config.retry.max_delay_ms),
            )
            .with_jitter(config.retry.jitter),
            breaker: BreakerConfig {
                threshold: config.breaker.threshold,
                reset_timeout: Duration::from_secs(config.breaker.reset_timeout_secs),
            },
            result_ttl: Duration::from_secs(config.cache.result_ttl_secs),
            result_max_entries: config.cache.result_max_entries,
            snapshots: SnapshotCacheConfig {
                default_max_age: Duration::from_secs(config.cache.snapshot_max_age_secs),
                retention: Duration::from_secs(config.cache.snapshot_retention_secs),
            },
        }
    }
}

/// Result of a query or table read, with where it came from
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub result: QueryResult,
    /// Fingerprint for queries, `location:namespace:table` for table reads
    pub cache_key: String,
    pub cached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Engine reachable and every circuit closed
    Healthy,
    /// Engine reachable but some operation's circuit is open
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub results: CacheStats,
    pub result_entries: usize,
    pub result_ttl_secs: u64,
    pub snapshots: SnapshotStats,
    pub snapshot_entries: Vec<SnapshotInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub alive: bool,
    pub engine: String,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<HealthError>,
    pub breakers: Vec<BreakerSnapshot>,
    pub pool: PoolSnapshot,
    pub cache: CacheSnapshot,
    pub metrics: MetricsSnapshot,
    pub checked_at: DateTime<Utc>,
}

pub struct ExecutionService {
    config: ExecutionConfig,
    query_engine: Arc<dyn DatabaseAdapter>,
    table_engine: Arc<dyn DatabaseAdapter>,
    query_breaker: Arc<CircuitBreaker>,
    table_breaker: Arc<CircuitBreaker>,
    query_op: GuardedOperation,
    table_op: GuardedOperation,
    health_op: GuardedOperation,
    results: Arc<QueryResultCache>,
    snapshots: Arc<TableSnapshotCache>,
    pool_monitor: Arc<PoolMonitor>,
    metrics: Arc<ExecutionMetrics>,
}

impl ExecutionService {
    pub fn new(
        config: ExecutionConfig,
        query_engine: Arc<dyn DatabaseAdapter>,
        table_engine: Arc<dyn DatabaseAdapter>,
        pool_monitor: Arc<PoolMonitor>,
    ) -> Self {
        Self::with_clock(config, query_engine, table_engine, pool_monitor, system_clock())
    }

    pub fn with_clock(
        config: ExecutionConfig,
        query_engine: Arc<dyn DatabaseAdapter>,
        table_engine: Arc<dyn DatabaseAdapter>,
        pool_monitor: Arc<PoolMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let query_breaker = Arc::new(CircuitBreaker::with_clock("query", config.breaker, clock.clone()));
        let table_breaker = Arc::new(CircuitBreaker::with_clock("table", config.breaker, clock.clone()));

        let query_op = config.retry.guard(EXECUTE_QUERY, query_breaker.clone());
        let table_op = config.retry.guard(READ_TABLE, table_breaker.clone());
        // Health checks report the engine as it is right now, so no retries
        let health_policy = RetryPolicy {
            max_attempts: 1,
            ..config.retry.clone()
        };
        let health_op = health_policy.guard(HEALTH_CHECK, query_breaker.clone());

        let results = Arc::new(QueryResultCache::with_clock(
            config.result_max_entries,
            config.result_ttl,
            clock.clone(),
        ));
        let snapshots = Arc::new(TableSnapshotCache::with_clock(config.snapshots, clock));

        tracing::info!(
            query_engine = query_engine.database_type(),
            table_engine = table_engine.database_type(),
            max_attempts = config.retry.max_attempts,
            breaker_threshold = config.breaker.threshold,
            result_ttl_secs = config.result_ttl.as_secs(),
            "Execution service initialized"
        );

        Self {
            config,
            query_engine,
            table_engine,
            query_breaker,
            table_breaker,
            query_op,
            table_op,
            health_op,
            results,
            snapshots,
            pool_monitor,
            metrics: Arc::new(ExecutionMetrics::new()),
        }
    }

    pub async fn execute_query(&self, query: &str, params: &[CellValue]) -> Result<ExecutionOutcome, AppError> {
        self.execute_query_cancellable(query, params, &CancellationToken::new())
            .await
    }

    /// Run a query through the result cache and the guarded query engine
    pub async fn execute_query_cancellable(
        &self,
        query: &str,
        params: &[CellValue],
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, AppError> {
        if query.trim().is_empty() {
            return Err(AppError::InvalidInput("Query must not be empty".to_string()));
        }

        let fingerprint = QueryResultCache::fingerprint(query, params);
        if let Some(result) = self.results.get(&fingerprint) {
            self.metrics.record_cache_hit();
            self.metrics.record_query();
            return Ok(ExecutionOutcome {
                result,
                cache_key: fingerprint,
                cached: true,
            });
        }
        self.metrics.record_cache_miss();

        let _active = self.metrics.begin_query();
        let engine = &self.query_engine;
        let timeout = self.config.query_timeout_secs;
        let outcome = self
            .query_op
            .call(cancel, || engine.execute_query(query, params, timeout))
            .await;

        match outcome {
            Ok(result) => {
                self.results.put(fingerprint.clone(), result.clone());
                self.metrics.record_query();
                tracing::debug!(
                    fingerprint = %fingerprint,
                    rows = result.row_count,
                    elapsed_ms = result.execution_time_ms,
                    "Query executed"
                );
                Ok(ExecutionOutcome {
                    result,
                    cache_key: fingerprint,
                    cached: false,
                })
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    pub async fn read_table(
        &self,
        location: &str,
        namespace: &str,
        table: &str,
        options: ReadOptions,
    ) -> Result<ExecutionOutcome, AppError> {
        self.read_table_cancellable(location, namespace, table, options, &CancellationToken::new())
            .await
    }

    /// Read a whole table through the snapshot cache and the guarded table engine.
    ///
    /// The snapshot is cached whole; `options.columns` only shapes what is returned.
    pub async fn read_table_cancellable(
        &self,
        location: &str,
        namespace: &str,
        table: &str,
        options: ReadOptions,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, AppError> {
        if namespace.trim().is_empty() || table.trim().is_empty() {
            return Err(AppError::InvalidInput(
                "Namespace and table must not be empty".to_string(),
            ));
        }

        let key = TableKey::new(location, namespace, table);
        let cache_key = key.to_string();

        if options.use_cache {
            if let Some(result) = self.snapshots.get(&key, options.max_age, options.force_refresh) {
                self.metrics.record_cache_hit();
                self.metrics.record_table_read();
                return Ok(ExecutionOutcome {
                    result: Self::shape(result, options.columns.as_deref())?,
                    cache_key,
                    cached: true,
                });
            }
            self.metrics.record_cache_miss();
        }

        let _active = self.metrics.begin_query();
        let engine = &self.table_engine;
        let timeout = self.config.query_timeout_secs;
        let outcome = self
            .table_op
            .call(cancel, || engine.read_table(&key, timeout))
            .await;

        match outcome {
            Ok(result) => {
                if options.use_cache {
                    self.snapshots.put(key.clone(), result.clone());
                }
                self.metrics.record_table_read();
                tracing::debug!(table = %key, rows = result.row_count, "Table read");
                Ok(ExecutionOutcome {
                    result: Self::shape(result, options.columns.as_deref())?,
                    cache_key,
                    cached: false,
                })
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn shape(result: QueryResult, columns: Option<&[String]>) -> Result<QueryResult, AppError> {
        match columns {
            Some(columns) => result.project(columns),
            None => Ok(result),
        }
    }

    fn fail(&self, err: AppError) -> AppError {
        if !matches!(err, AppError::Cancelled(_)) {
            self.metrics.record_error();
        }
        err
    }

    /// Ping the query engine through its breaker without touching the caches
    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let engine = &self.query_engine;
        let timeout = Duration::from_secs(self.config.health_timeout_secs.max(1));

        let ping = self
            .health_op
            .call(&CancellationToken::new(), || async move {
                tokio::time::timeout(timeout, engine.test_connection())
                    .await
                    .map_err(|_| AppError::Connection("Health check timed out".to_string()))?
            })
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let breakers = self.breaker_snapshots();
        let any_open = breakers.iter().any(BreakerSnapshot::has_open_circuit);

        let (status, error) = match ping {
            Ok(()) if any_open => (HealthStatus::Degraded, None),
            Ok(()) => (HealthStatus::Healthy, None),
            Err(err) => {
                tracing::warn!(error = %err, "Health check failed");
                (
                    HealthStatus::Unhealthy,
                    Some(HealthError {
                        kind: err.kind(),
                        message: err.to_string(),
                    }),
                )
            }
        };

        HealthReport {
            status,
            alive: error.is_none(),
            engine: self.query_engine.database_type().to_string(),
            latency_ms,
            error,
            breakers,
            pool: self.pool_monitor.snapshot(),
            cache: self.cache_snapshot(),
            metrics: self.metrics.snapshot(),
            checked_at: Utc::now(),
        }
    }

    /// Drop cache entries in `scope`; returns how many were removed
    pub fn invalidate(&self, scope: &InvalidationScope) -> usize {
        let removed = match scope {
            InvalidationScope::All => self.results.clear() + self.snapshots.clear(),
            InvalidationScope::Results => self.results.clear(),
            InvalidationScope::Snapshots => self.snapshots.clear(),
            InvalidationScope::Fingerprint { fingerprint } => {
                usize::from(self.results.invalidate(fingerprint))
            }
            InvalidationScope::Query { query, params } => {
                usize::from(self.results.invalidate(&QueryResultCache::fingerprint(query, params)))
            }
            InvalidationScope::Table {
                location,
                namespace,
                table,
            } => usize::from(
                self.snapshots
                    .invalidate(&TableKey::new(location.as_str(), namespace.as_str(), table.as_str())),
            ),
            InvalidationScope::TableName { table } => self.snapshots.invalidate_table(table),
        };

        tracing::info!(scope = ?scope, removed, "Cache invalidated");
        removed
    }

    pub fn cache_snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            results: self.results.get_stats(),
            result_entries: self.results.size(),
            result_ttl_secs: self.results.ttl().as_secs(),
            snapshots: self.snapshots.stats(),
            snapshot_entries: self.snapshots.entries(),
        }
    }

    /// Sweep expired entries from both caches
    pub fn cleanup_expired(&self) -> usize {
        self.results.cleanup_expired() + self.snapshots.cleanup_expired()
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        vec![self.query_breaker.snapshot(), self.table_breaker.snapshot()]
    }

    pub fn query_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.query_breaker
    }

    pub fn table_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.table_breaker
    }

    pub fn results(&self) -> &Arc<QueryResultCache> {
        &self.results
    }

    pub fn snapshots(&self) -> &Arc<TableSnapshotCache> {
        &self.snapshots
    }

    pub fn pool_monitor(&self) -> &Arc<PoolMonitor> {
        &self.pool_monitor
    }

    pub fn metrics(&self) -> &Arc<ExecutionMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Row;
    use crate::services::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Engine that replays scripted outcomes, then succeeds
    #[derive(Default)]
    struct ScriptedEngine {
        failures: Mutex<Vec<AppError>>,
        calls: AtomicUsize,
    }

    impl ScriptedEngine {
        fn failing_with(errors: Vec<AppError>) -> Self {
            Self {
                failures: Mutex::new(errors),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next(&self) -> Result<QueryResult, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                let mut row = Row::new();
                row.push("id", CellValue::Int(1));
                row.push("name", CellValue::Text("alice".into()));
                Ok(QueryResult::new(vec![row], 1))
            } else {
                Err(failures.remove(0))
            }
        }
    }

    #[async_trait::async_trait]
    impl DatabaseAdapter for ScriptedEngine {
        async fn execute_query(&self, _sql: &str, _params: &[CellValue], _timeout: u64) -> Result<QueryResult, AppError> {
            self.next()
        }

        async fn read_table(&self, _key: &TableKey, _timeout: u64) -> Result<QueryResult, AppError> {
            self.next()
        }

        fn database_type(&self) -> &str {
            "scripted"
        }

        async fn test_connection(&self) -> Result<(), AppError> {
            self.next().map(|_| ())
        }
    }

    fn fast_config() -> ExecutionConfig {
        ExecutionConfig {
            retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
            ..ExecutionConfig::default()
        }
    }

    fn service(engine: Arc<ScriptedEngine>) -> (ExecutionService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let service = ExecutionService::with_clock(
            fast_config(),
            engine.clone(),
            engine,
            Arc::new(PoolMonitor::new("test")),
            clock.clone(),
        );
        (service, clock)
    }

    #[tokio::test]
    async fn test_second_query_is_served_from_cache() {
        let engine = Arc::new(ScriptedEngine::default());
        let (service, _clock) = service(engine.clone());

        let first = service.execute_query("SELECT 1", &[]).await.unwrap();
        let second = service.execute_query("SELECT 1", &[]).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.cache_key, second.cache_key);
        assert!(Arc::ptr_eq(&first.result.rows, &second.result.rows));
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_query_cache_expires_after_ttl() {
        let engine = Arc::new(ScriptedEngine::default());
        let (service, clock) = service(engine.clone());

        service.execute_query("SELECT 1", &[]).await.unwrap();
        clock.advance(Duration::from_secs(301));
        let again = service.execute_query("SELECT 1", &[]).await.unwrap();

        assert!(!again.cached);
        assert_eq!(engine.calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_and_not_cached() {
        let engine = Arc::new(ScriptedEngine::failing_with(vec![AppError::Connection("reset".into())]));
        let (service, _clock) = service(engine.clone());

        let outcome = service.execute_query("SELECT 1", &[]).await.unwrap();
        assert!(!outcome.cached);
        assert_eq!(engine.calls(), 2);
        assert_eq!(service.query_breaker().failure_count(EXECUTE_QUERY), 0);
    }

    #[tokio::test]
    async fn test_invalid_input_is_not_retried() {
        let engine = Arc::new(ScriptedEngine::failing_with(vec![AppError::InvalidInput("syntax".into())]));
        let (service, _clock) = service(engine.clone());

        let err = service.execute_query("SELEC 1", &[]).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        assert_eq!(engine.calls(), 1);
        assert_eq!(service.results().size(), 0);
        assert_eq!(service.metrics().snapshot().errors, 1);
    }

    #[tokio::test]
    async fn test_empty_query_rejected_before_engine() {
        let engine = Arc::new(ScriptedEngine::default());
        let (service, _clock) = service(engine.clone());
        assert!(matches!(
            service.execute_query("   ", &[]).await,
            Err(AppError::InvalidInput(_))
        ));
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_table_read_projection_keeps_snapshot_whole() {
        let engine = Arc::new(ScriptedEngine::default());
        let (service, _clock) = service(engine.clone());

        let options = ReadOptions {
            columns: Some(vec!["name".to_string()]),
            ..ReadOptions::default()
        };
        let outcome = service.read_table("wh", "sales", "orders", options).await.unwrap();
        assert_eq!(outcome.result.columns(), vec!["name"]);
        assert_eq!(outcome.cache_key, "wh:sales:orders");

        let whole = service
            .read_table("wh", "sales", "orders", ReadOptions::default())
            .await
            .unwrap();
        assert!(whole.cached);
        assert_eq!(whole.result.columns(), vec!["id", "name"]);
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_table_read_without_cache() {
        let engine = Arc::new(ScriptedEngine::default());
        let (service, _clock) = service(engine.clone());

        let options = ReadOptions {
            use_cache: false,
            ..ReadOptions::default()
        };
        service.read_table("wh", "sales", "orders", options.clone()).await.unwrap();
        service.read_table("wh", "sales", "orders", options).await.unwrap();
        assert_eq!(engine.calls(), 2);
        assert_eq!(service.snapshots().size(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_scopes() {
        let engine = Arc::new(ScriptedEngine::default());
        let (service, _clock) = service(engine);

        service.execute_query("SELECT 1", &[CellValue::Int(1)]).await.unwrap();
        service.execute_query("SELECT 2", &[]).await.unwrap();
        service.read_table("wh", "sales", "orders", ReadOptions::default()).await.unwrap();
        service.read_table("wh", "sales", "orders_2024", ReadOptions::default()).await.unwrap();
        service.read_table("wh", "crm", "customers", ReadOptions::default()).await.unwrap();

        let by_query = InvalidationScope::Query {
            query: "SELECT 1".into(),
            params: vec![CellValue::Int(1)],
        };
        assert_eq!(service.invalidate(&by_query), 1);
        assert_eq!(service.invalidate(&by_query), 0);

        let by_name = InvalidationScope::TableName { table: "orders".into() };
        assert_eq!(service.invalidate(&by_name), 2);

        let by_key = InvalidationScope::Table {
            location: "wh".into(),
            namespace: "crm".into(),
            table: "customers".into(),
        };
        assert_eq!(service.invalidate(&by_key), 1);

        assert_eq!(service.invalidate(&InvalidationScope::All), 1);
        assert_eq!(service.results().size(), 0);
    }

    #[tokio::test]
    async fn test_health_check_is_uncached_and_reports_state() {
        let engine = Arc::new(ScriptedEngine::default());
        let (service, _clock) = service(engine.clone());

        let report = service.health_check().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.alive);
        assert_eq!(report.engine, "scripted");
        assert_eq!(report.breakers.len(), 2);
        assert_eq!(report.cache.result_entries, 0);

        service.health_check().await;
        assert_eq!(engine.calls(), 2);
    }

    #[tokio::test]
    async fn test_health_check_does_not_retry() {
        let engine = Arc::new(ScriptedEngine::failing_with(vec![AppError::Connection("down".into())]));
        let (service, _clock) = service(engine.clone());

        let report = service.health_check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!report.alive);
        assert_eq!(report.error.as_ref().map(|e| e.kind), Some(ErrorKind::Connection));
        assert_eq!(engine.calls(), 1);
        assert_eq!(service.query_breaker().failure_count(HEALTH_CHECK), 1);
        assert_eq!(service.query_breaker().failure_count(EXECUTE_QUERY), 0);
    }

    #[tokio::test]
    async fn test_cancelled_query_is_not_a_failure() {
        let engine = Arc::new(ScriptedEngine::default());
        let (service, _clock) = service(engine.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = service
            .execute_query_cancellable("SELECT 1", &[], &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Cancelled(_)));
        assert_eq!(service.metrics().snapshot().errors, 0);
        assert_eq!(service.results().size(), 0);
    }
}
