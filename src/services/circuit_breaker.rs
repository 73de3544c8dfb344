// Circuit Breaker
//
// Per-operation failure bookkeeping. Each operation key has its own entry in a
// sharded map, so a failing `read_table` never blocks bookkeeping for
// `execute_query`.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::middleware::AppError;
use crate::services::clock::{system_clock, Clock};

/// Observable state of one operation key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Failures before the circuit opens
    pub threshold: u32,
    /// How long an open circuit rejects calls before admitting a probe
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct BreakerState {
    failure_count: u32,
    last_failure_time: Option<Instant>,
    /// Set while the single half-open probe is outstanding
    probe_started: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationState {
    pub operation: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub seconds_since_failure: Option<f64>,
}

/// Point-in-time view of one breaker, for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub threshold: u32,
    pub reset_timeout_secs: u64,
    pub operations: Vec<OperationState>,
}

impl BreakerSnapshot {
    pub fn has_open_circuit(&self) -> bool {
        self.operations
            .iter()
            .any(|op| op.state != CircuitState::Closed)
    }
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    operations: DashMap<String, BreakerState>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    pub fn with_clock(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            operations: DashMap::new(),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Record one failed logical call for `operation`.
    ///
    /// A failed probe lands here too and re-opens the circuit with a fresh
    /// failure timestamp.
    pub fn record_failure(&self, operation: &str, error: &AppError) {
        let now = self.clock.now();
        let failures = {
            let mut state = self.operations.entry(operation.to_string()).or_default();
            state.failure_count = state.failure_count.saturating_add(1);
            state.last_failure_time = Some(now);
            state.probe_started = None;
            state.failure_count
        };

        tracing::warn!(
            breaker = %self.name,
            operation,
            failures,
            error = %error,
            error_kind = ?error.kind(),
            "Circuit breaker failure recorded"
        );

        if failures >= self.config.threshold {
            tracing::warn!(
                breaker = %self.name,
                operation,
                failures,
                threshold = self.config.threshold,
                "Circuit breaker opened"
            );
        }
    }

    /// Clear all failure state for `operation`
    pub fn record_success(&self, operation: &str) {
        if let Some((_, state)) = self.operations.remove(operation) {
            if state.failure_count >= self.config.threshold {
                tracing::info!(breaker = %self.name, operation, "Circuit breaker closed");
            }
        }
    }

    /// Whether a call for `operation` may proceed.
    ///
    /// Once the reset timeout has passed on an open circuit, exactly one
    /// caller is admitted as the probe; the check and the claim happen under
    /// the same shard lock. Others keep seeing an open circuit until the
    /// probe resolves through `record_success` or `record_failure`.
    pub fn is_closed(&self, operation: &str) -> bool {
        let now = self.clock.now();
        let Some(mut state) = self.operations.get_mut(operation) else {
            return true;
        };

        if state.failure_count < self.config.threshold {
            return true;
        }

        let cooled_down = state
            .last_failure_time
            .map(|at| now.saturating_duration_since(at) > self.config.reset_timeout)
            .unwrap_or(true);
        if !cooled_down {
            return false;
        }

        // An abandoned probe frees its slot after another reset window.
        if let Some(started) = state.probe_started {
            if now.saturating_duration_since(started) <= self.config.reset_timeout {
                return false;
            }
        }

        state.probe_started = Some(now);
        drop(state);

        tracing::info!(breaker = %self.name, operation, "Circuit breaker half-open, admitting probe");
        true
    }

    /// Give back a probe slot whose caller went away without an outcome
    pub fn release_probe(&self, operation: &str) {
        if let Some(mut state) = self.operations.get_mut(operation) {
            state.probe_started = None;
        }
    }

    pub fn state(&self, operation: &str) -> CircuitState {
        match self.operations.get(operation) {
            Some(state) => self.classify(&state, self.clock.now()),
            None => CircuitState::Closed,
        }
    }

    pub fn failure_count(&self, operation: &str) -> u32 {
        self.operations
            .get(operation)
            .map(|state| state.failure_count)
            .unwrap_or(0)
    }

    /// Clear every operation's state
    pub fn reset(&self) {
        self.operations.clear();
        tracing::info!(breaker = %self.name, "Circuit breaker reset");
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let mut operations: Vec<OperationState> = self
            .operations
            .iter()
            .map(|entry| OperationState {
                operation: entry.key().clone(),
                state: self.classify(entry.value(), now),
                failure_count: entry.value().failure_count,
                seconds_since_failure: entry
                    .value()
                    .last_failure_time
                    .map(|at| now.saturating_duration_since(at).as_secs_f64()),
            })
            .collect();
        operations.sort_by(|a, b| a.operation.cmp(&b.operation));

        BreakerSnapshot {
            name: self.name.clone(),
            threshold: self.config.threshold,
            reset_timeout_secs: self.config.reset_timeout.as_secs(),
            operations,
        }
    }

    fn classify(&self, state: &BreakerState, now: Instant) -> CircuitState {
        if state.failure_count < self.config.threshold {
            return CircuitState::Closed;
        }
        if state.probe_started.is_some() {
            return CircuitState::HalfOpen;
        }
        match state.last_failure_time {
            Some(at) if now.saturating_duration_since(at) <= self.config.reset_timeout => {
                CircuitState::Open
            }
            _ => CircuitState::HalfOpen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::with_clock(
            "test",
            BreakerConfig {
                threshold: 5,
                reset_timeout: Duration::from_secs(60),
            },
            clock,
        )
    }

    fn failure() -> AppError {
        AppError::Connection("connection refused".to_string())
    }

    #[test]
    fn test_closed_without_failures() {
        let breaker = breaker(Arc::new(ManualClock::new()));
        assert!(breaker.is_closed("execute_query"));
        assert_eq!(breaker.state("execute_query"), CircuitState::Closed);
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = breaker(Arc::new(ManualClock::new()));
        for _ in 0..4 {
            breaker.record_failure("read_table", &failure());
            assert!(breaker.is_closed("read_table"));
        }
        breaker.record_failure("read_table", &failure());
        assert!(!breaker.is_closed("read_table"));
        assert_eq!(breaker.state("read_table"), CircuitState::Open);
        assert_eq!(breaker.failure_count("read_table"), 5);
    }

    #[test]
    fn test_operations_are_isolated() {
        let breaker = breaker(Arc::new(ManualClock::new()));
        for _ in 0..5 {
            breaker.record_failure("read_table", &failure());
        }
        assert!(!breaker.is_closed("read_table"));
        assert!(breaker.is_closed("execute_query"));
    }

    #[test]
    fn test_success_fully_resets() {
        let breaker = breaker(Arc::new(ManualClock::new()));
        for _ in 0..4 {
            breaker.record_failure("execute_query", &failure());
        }
        breaker.record_success("execute_query");
        assert_eq!(breaker.failure_count("execute_query"), 0);

        // Needs a full threshold again to open
        for _ in 0..4 {
            breaker.record_failure("execute_query", &failure());
        }
        assert!(breaker.is_closed("execute_query"));
    }

    #[test]
    fn test_half_open_admits_exactly_one_probe() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock.clone());
        for _ in 0..5 {
            breaker.record_failure("read_table", &failure());
        }
        assert!(!breaker.is_closed("read_table"));

        clock.advance(Duration::from_secs(59));
        assert!(!breaker.is_closed("read_table"));

        clock.advance(Duration::from_secs(2));
        assert!(breaker.is_closed("read_table"));
        assert!(!breaker.is_closed("read_table"));
        assert_eq!(breaker.state("read_table"), CircuitState::HalfOpen);

        breaker.record_success("read_table");
        assert!(breaker.is_closed("read_table"));
        assert!(breaker.is_closed("read_table"));
        assert_eq!(breaker.state("read_table"), CircuitState::Closed);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock.clone());
        for _ in 0..5 {
            breaker.record_failure("read_table", &failure());
        }
        clock.advance(Duration::from_secs(61));
        assert!(breaker.is_closed("read_table"));

        breaker.record_failure("read_table", &failure());
        assert!(!breaker.is_closed("read_table"));
        assert_eq!(breaker.state("read_table"), CircuitState::Open);

        clock.advance(Duration::from_secs(61));
        assert!(breaker.is_closed("read_table"));
    }

    #[test]
    fn test_released_probe_can_be_reclaimed() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock.clone());
        for _ in 0..5 {
            breaker.record_failure("read_table", &failure());
        }
        clock.advance(Duration::from_secs(61));
        assert!(breaker.is_closed("read_table"));
        assert!(!breaker.is_closed("read_table"));

        breaker.release_probe("read_table");
        assert!(breaker.is_closed("read_table"));
    }

    #[test]
    fn test_abandoned_probe_expires() {
        let clock = Arc::new(ManualClock::new());
        let breaker = breaker(clock.clone());
        for _ in 0..5 {
            breaker.record_failure("read_table", &failure());
        }
        clock.advance(Duration::from_secs(61));
        assert!(breaker.is_closed("read_table"));

        clock.advance(Duration::from_secs(61));
        assert!(breaker.is_closed("read_table"));
    }

    #[test]
    fn test_reset_clears_everything() {
        let breaker = breaker(Arc::new(ManualClock::new()));
        for _ in 0..5 {
            breaker.record_failure("a", &failure());
            breaker.record_failure("b", &failure());
        }
        breaker.reset();
        assert!(breaker.is_closed("a"));
        assert!(breaker.is_closed("b"));
        assert!(breaker.snapshot().operations.is_empty());
    }

    #[test]
    fn test_snapshot_reports_open_operations() {
        let breaker = breaker(Arc::new(ManualClock::new()));
        breaker.record_failure("execute_query", &failure());
        for _ in 0..5 {
            breaker.record_failure("read_table", &failure());
        }

        let snapshot = breaker.snapshot();
        assert!(snapshot.has_open_circuit());
        assert_eq!(snapshot.operations.len(), 2);
        assert_eq!(snapshot.operations[0].operation, "execute_query");
        assert_eq!(snapshot.operations[0].state, CircuitState::Closed);
        assert_eq!(snapshot.operations[1].state, CircuitState::Open);
    }
}
