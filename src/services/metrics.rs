// Execution metrics
//
// Process-wide counters for the execution layer plus a background task that
// logs them on an interval and sweeps expired cache entries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::services::execution::ExecutionService;

#[derive(Debug, Default)]
pub struct ExecutionMetrics {
    queries_executed: AtomicU64,
    tables_read: AtomicU64,
    errors: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    active_queries: AtomicI64,
    last_update: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub queries_executed: u64,
    pub tables_read: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub active_queries: i64,
    pub last_update: Option<DateTime<Utc>>,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a call as in flight until the returned guard drops
    pub fn begin_query(&self) -> ActiveQueryGuard<'_> {
        self.active_queries.fetch_add(1, Ordering::Relaxed);
        self.touch();
        ActiveQueryGuard { metrics: self }
    }

    pub fn record_query(&self) {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_table_read(&self) {
        self.tables_read.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queries_executed: self.queries_executed.load(Ordering::Relaxed),
            tables_read: self.tables_read.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            active_queries: self.active_queries.load(Ordering::Relaxed),
            last_update: *self.last_update.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn touch(&self) {
        *self.last_update.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }
}

pub struct ActiveQueryGuard<'a> {
    metrics: &'a ExecutionMetrics,
}

impl Drop for ActiveQueryGuard<'_> {
    fn drop(&mut self) {
        self.metrics.active_queries.fetch_sub(1, Ordering::Relaxed);
        self.metrics.touch();
    }
}

/// Periodic metrics logging and cache sweeping
pub struct MetricsReporter;

impl MetricsReporter {
    /// Start the reporter; it runs until `shutdown` is cancelled
    pub fn spawn(
        interval: Duration,
        service: Arc<ExecutionService>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Metrics reporter started (interval: {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => Self::report(&service),
                }
            }
            tracing::info!("Metrics reporter stopped");
        })
    }

    fn report(service: &ExecutionService) {
        let metrics = service.metrics().snapshot();
        let pool = service.pool_monitor().snapshot();
        let swept = service.cleanup_expired();

        tracing::info!(
            queries_executed = metrics.queries_executed,
            tables_read = metrics.tables_read,
            errors = metrics.errors,
            cache_hits = metrics.cache_hits,
            cache_misses = metrics.cache_misses,
            active_queries = metrics.active_queries,
            pool_total = pool.total_connections,
            pool_checked_out = pool.checked_out,
            expired_entries_removed = swept,
            "Execution metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = ExecutionMetrics::new();
        metrics.record_query();
        metrics.record_query();
        metrics.record_table_read();
        metrics.record_error();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_cache_miss();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queries_executed, 2);
        assert_eq!(snapshot.tables_read, 1);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 2);
        assert!(snapshot.last_update.is_some());
    }

    #[test]
    fn test_active_query_guard() {
        let metrics = ExecutionMetrics::new();
        {
            let _first = metrics.begin_query();
            let _second = metrics.begin_query();
            assert_eq!(metrics.snapshot().active_queries, 2);
        }
        assert_eq!(metrics.snapshot().active_queries, 0);
    }
}
