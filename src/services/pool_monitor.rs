// Connection pool instrumentation
//
// Counts connect/close/checkout/checkin events reported by a pool. Readers get
// a copy of the counters; an event that would drive a counter negative is
// rejected and leaves the counters as they were.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolEventError {
    #[error("close reported with no open connections")]
    CloseWithoutConnect,
    #[error("checkout reported with no idle connections")]
    CheckoutWithoutIdle,
    #[error("checkin reported with no checked-out connections")]
    CheckinWithoutCheckout,
}

/// Point-in-time pool counters. `total_connections == checked_in + checked_out`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub total_connections: u64,
    pub checked_out: u64,
    pub checked_in: u64,
    pub last_update: Option<DateTime<Utc>>,
}

/// Hooks a pool calls as connections move through their lifecycle
pub trait PoolEventListener: Send + Sync {
    fn on_connect(&self);
    fn on_close(&self) -> Result<(), PoolEventError>;
    fn on_checkout(&self) -> Result<(), PoolEventError>;
    fn on_checkin(&self) -> Result<(), PoolEventError>;
}

#[derive(Debug)]
pub struct PoolMonitor {
    name: String,
    snapshot: Mutex<PoolSnapshot>,
}

impl PoolMonitor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            snapshot: Mutex::new(PoolSnapshot::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        *self.lock()
    }

    /// Apply `change` to a copy and commit it only if it succeeds
    fn apply<F>(&self, event: &str, change: F) -> Result<(), PoolEventError>
    where
        F: FnOnce(&mut PoolSnapshot) -> Result<(), PoolEventError>,
    {
        let mut current = self.lock();
        let mut next = *current;
        change(&mut next)?;
        next.last_update = Some(Utc::now());
        *current = next;
        drop(current);

        tracing::debug!(
            pool = %self.name,
            event,
            total = next.total_connections,
            checked_out = next.checked_out,
            checked_in = next.checked_in,
            "Pool event"
        );
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, PoolSnapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PoolEventListener for PoolMonitor {
    fn on_connect(&self) {
        // Connect has no precondition, so the closure cannot fail.
        let _ = self.apply("connect", |s| {
            s.total_connections += 1;
            s.checked_in += 1;
            Ok(())
        });
    }

    fn on_close(&self) -> Result<(), PoolEventError> {
        self.apply("close", |s| {
            s.total_connections = s
                .total_connections
                .checked_sub(1)
                .ok_or(PoolEventError::CloseWithoutConnect)?;
            if s.checked_in > 0 {
                s.checked_in -= 1;
            } else {
                s.checked_out -= 1;
            }
            Ok(())
        })
    }

    fn on_checkout(&self) -> Result<(), PoolEventError> {
        self.apply("checkout", |s| {
            s.checked_in = s
                .checked_in
                .checked_sub(1)
                .ok_or(PoolEventError::CheckoutWithoutIdle)?;
            s.checked_out += 1;
            Ok(())
        })
    }

    fn on_checkin(&self) -> Result<(), PoolEventError> {
        self.apply("checkin", |s| {
            s.checked_out = s
                .checked_out
                .checked_sub(1)
                .ok_or(PoolEventError::CheckinWithoutCheckout)?;
            s.checked_in += 1;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn assert_consistent(snapshot: PoolSnapshot) {
        assert_eq!(
            snapshot.total_connections,
            snapshot.checked_in + snapshot.checked_out
        );
    }

    #[test]
    fn test_new_monitor_is_empty() {
        let monitor = PoolMonitor::new("postgres");
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot, PoolSnapshot::default());
        assert!(snapshot.last_update.is_none());
    }

    #[test]
    fn test_connection_lifecycle() {
        let monitor = PoolMonitor::new("postgres");
        monitor.on_connect();
        monitor.on_connect();
        monitor.on_checkout().unwrap();

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.checked_out, 1);
        assert_eq!(snapshot.checked_in, 1);
        assert!(snapshot.last_update.is_some());
        assert_consistent(snapshot);

        monitor.on_checkin().unwrap();
        monitor.on_close().unwrap();
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.total_connections, 1);
        assert_eq!(snapshot.checked_in, 1);
        assert_consistent(snapshot);
    }

    #[test]
    fn test_close_prefers_idle_connection() {
        let monitor = PoolMonitor::new("postgres");
        monitor.on_connect();
        monitor.on_connect();
        monitor.on_checkout().unwrap();
        monitor.on_close().unwrap();

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.checked_in, 0);
        assert_eq!(snapshot.checked_out, 1);

        // Only an in-use connection is left
        monitor.on_close().unwrap();
        assert_eq!(monitor.snapshot().total_connections, 0);
        assert_consistent(monitor.snapshot());
    }

    #[test]
    fn test_unmatched_events_leave_counters_unchanged() {
        let monitor = PoolMonitor::new("postgres");
        assert_eq!(monitor.on_close(), Err(PoolEventError::CloseWithoutConnect));
        assert_eq!(monitor.on_checkout(), Err(PoolEventError::CheckoutWithoutIdle));
        assert_eq!(monitor.on_checkin(), Err(PoolEventError::CheckinWithoutCheckout));
        assert_eq!(monitor.snapshot(), PoolSnapshot::default());

        monitor.on_connect();
        let before = monitor.snapshot();
        assert_eq!(monitor.on_checkin(), Err(PoolEventError::CheckinWithoutCheckout));
        assert_eq!(monitor.snapshot(), before);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let monitor = PoolMonitor::new("postgres");
        monitor.on_connect();
        let snapshot = monitor.snapshot();
        monitor.on_connect();
        assert_eq!(snapshot.total_connections, 1);
        assert_eq!(monitor.snapshot().total_connections, 2);
    }

    #[tokio::test]
    async fn test_concurrent_checkout_checkin() {
        let monitor = Arc::new(PoolMonitor::new("postgres"));
        for _ in 0..8 {
            monitor.on_connect();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let monitor = monitor.clone();
                tokio::spawn(async move {
                    for _ in 0..100 {
                        monitor.on_checkout().unwrap();
                        tokio::task::yield_now().await;
                        monitor.on_checkin().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.total_connections, 8);
        assert_eq!(snapshot.checked_in, 8);
        assert_eq!(snapshot.checked_out, 0);
    }
}
