// Table Snapshot Cache
//
// Holds the last full read of each table. Callers state how old a snapshot
// they accept; entries are only dropped once they pass the retention window,
// so a stale snapshot stays around as last-known-good while refreshes fail.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::models::TableKey;
use crate::services::clock::{system_clock, Clock};
use crate::services::database::adapter::QueryResult;

#[derive(Debug, Clone, Copy)]
pub struct SnapshotCacheConfig {
    /// Age limit when the caller does not give one
    pub default_max_age: Duration,
    /// Hard ceiling; older snapshots are never served and get dropped
    pub retention: Duration,
}

impl Default for SnapshotCacheConfig {
    fn default() -> Self {
        Self {
            default_max_age: Duration::from_secs(60),
            retention: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    result: QueryResult,
    columns: Vec<String>,
    created_at: Instant,
}

/// Description of one cached snapshot, without its rows
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub key: String,
    pub table: String,
    pub row_count: usize,
    pub columns: Vec<String>,
    pub age_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SnapshotStats {
    pub hits: u64,
    pub misses: u64,
    pub refreshes: u64,
    pub expirations: u64,
}

pub struct TableSnapshotCache {
    snapshots: RwLock<HashMap<TableKey, Snapshot>>,
    config: SnapshotCacheConfig,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    refreshes: AtomicU64,
    expirations: AtomicU64,
}

impl TableSnapshotCache {
    pub fn new(config: SnapshotCacheConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: SnapshotCacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            config,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> SnapshotCacheConfig {
        self.config
    }

    /// Look up a snapshot no older than `max_age`.
    ///
    /// `force_refresh` always misses but leaves the entry in place. A snapshot
    /// that is too old for this caller is kept unless it is past retention.
    pub fn get(&self, key: &TableKey, max_age: Option<Duration>, force_refresh: bool) -> Option<QueryResult> {
        if force_refresh {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Snapshot refresh forced for {}", key);
            return None;
        }

        let limit = max_age
            .unwrap_or(self.config.default_max_age)
            .min(self.config.retention);
        let now = self.clock.now();

        let age = {
            let snapshots = self.read();
            match snapshots.get(key) {
                Some(snapshot) => {
                    let age = now.saturating_duration_since(snapshot.created_at);
                    if age < limit {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("Snapshot hit for {} (age: {:?})", key, age);
                        return Some(snapshot.result.clone());
                    }
                    Some(age)
                }
                None => None,
            }
        };

        self.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(age) = age {
            if age >= self.config.retention {
                self.evict_if_expired(key, now);
            } else {
                tracing::debug!("Snapshot for {} too old for caller (age: {:?})", key, age);
            }
        }
        None
    }

    fn evict_if_expired(&self, key: &TableKey, now: Instant) {
        let mut snapshots = self.write();
        let expired = snapshots
            .get(key)
            .map(|snapshot| now.saturating_duration_since(snapshot.created_at) >= self.config.retention)
            .unwrap_or(false);
        if expired {
            snapshots.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Snapshot expired for {}", key);
        }
    }

    /// Store or replace the snapshot for `key`
    pub fn put(&self, key: TableKey, result: QueryResult) {
        let snapshot = Snapshot {
            columns: result.columns(),
            result,
            created_at: self.clock.now(),
        };
        let replaced = self.write().insert(key.clone(), snapshot).is_some();
        if replaced {
            self.refreshes.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!("Stored snapshot for {}", key);
    }

    pub fn invalidate(&self, key: &TableKey) -> bool {
        self.write().remove(key).is_some()
    }

    /// Drop every snapshot whose table name contains `partial`
    pub fn invalidate_table(&self, partial: &str) -> usize {
        let mut snapshots = self.write();
        let before = snapshots.len();
        snapshots.retain(|key, _| !key.table.contains(partial));
        let removed = before - snapshots.len();
        if removed > 0 {
            tracing::info!("Invalidated {} snapshots matching '{}'", removed, partial);
        }
        removed
    }

    pub fn clear(&self) -> usize {
        let mut snapshots = self.write();
        let count = snapshots.len();
        snapshots.clear();
        tracing::info!("Cleared {} table snapshots", count);
        count
    }

    /// Drop snapshots past retention
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let retention = self.config.retention;
        let mut snapshots = self.write();
        let before = snapshots.len();
        snapshots.retain(|_, snapshot| now.saturating_duration_since(snapshot.created_at) < retention);
        let removed = before - snapshots.len();
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            tracing::info!("Cleaned up {} expired table snapshots", removed);
        }
        removed
    }

    pub fn entries(&self) -> Vec<SnapshotInfo> {
        let now = self.clock.now();
        let mut entries: Vec<SnapshotInfo> = self
            .read()
            .iter()
            .map(|(key, snapshot)| SnapshotInfo {
                key: key.to_string(),
                table: key.table.clone(),
                row_count: snapshot.result.row_count,
                columns: snapshot.columns.clone(),
                age_secs: now.saturating_duration_since(snapshot.created_at).as_secs_f64(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn size(&self) -> usize {
        self.read().len()
    }

    pub fn stats(&self) -> SnapshotStats {
        SnapshotStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TableKey, Snapshot>> {
        self.snapshots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TableKey, Snapshot>> {
        self.snapshots.write().unwrap_or_else(PoisonError::into_inner)
    }
}
