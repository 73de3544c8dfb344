// Retry Policy
//
// Bounded exponential backoff around a fallible async call, gated by a
// circuit breaker. The breaker is consulted once up front and told about the
// outcome of the whole logical call, never about individual attempts.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::api::middleware::AppError;
use crate::services::circuit_breaker::CircuitBreaker;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per logical call, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Draw each delay uniformly from `[0, bound]` instead of sleeping the full bound
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Upper bound on the sleep before `attempt` (1-based).
    ///
    /// `min(base_delay * 2^(attempt - 2), max_delay)`, and zero before the first attempt.
    pub fn backoff_bound(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Actual sleep before `attempt`
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let bound = self.backoff_bound(attempt);
        if !self.jitter || bound.is_zero() {
            return bound;
        }
        let bound_nanos = u64::try_from(bound.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::thread_rng().gen_range(0..=bound_nanos))
    }

    /// Bind this policy to an operation key and breaker.
    pub fn guard(&self, operation: impl Into<String>, breaker: Arc<CircuitBreaker>) -> GuardedOperation {
        GuardedOperation {
            operation: operation.into(),
            policy: self.clone(),
            breaker,
        }
    }

    /// Run `call` under this policy.
    ///
    /// Fails with `CircuitOpen` without calling anything when the breaker is
    /// open. Non-retryable errors end the call at once. The error returned is
    /// the last one `call` produced, untouched. Cancelling `cancel` aborts the
    /// attempt in flight or the backoff sleep and yields `Cancelled`.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        breaker: &CircuitBreaker,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        if !breaker.is_closed(operation) {
            tracing::warn!(breaker = breaker.name(), operation, "Circuit breaker open, rejecting call");
            return Err(AppError::CircuitOpen(operation.to_string()));
        }

        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = call() => Some(result),
            };

            let Some(result) = outcome else {
                return Err(Self::abandon(operation, breaker));
            };

            match result {
                Ok(value) => {
                    breaker.record_success(operation);
                    if attempt > 1 {
                        tracing::info!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(AppError::Cancelled(reason)) => {
                    breaker.release_probe(operation);
                    return Err(AppError::Cancelled(reason));
                }
                Err(err) => {
                    if !err.is_retryable() || attempt >= max_attempts {
                        tracing::error!(
                            operation,
                            attempts = attempt,
                            error = %err,
                            error_kind = ?err.kind(),
                            "Operation failed"
                        );
                        breaker.record_failure(operation, &err);
                        return Err(err);
                    }

                    attempt += 1;
                    let delay = self.delay_before(attempt);
                    tracing::warn!(
                        operation,
                        next_attempt = attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, backing off"
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Self::abandon(operation, breaker)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn abandon(operation: &str, breaker: &CircuitBreaker) -> AppError {
        breaker.release_probe(operation);
        tracing::info!(operation, "Operation cancelled by caller");
        AppError::Cancelled(operation.to_string())
    }
}

/// A retry policy and breaker bound to one operation key: wrap once, call many.
#[derive(Clone)]
pub struct GuardedOperation {
    operation: String,
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedOperation {
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn call<T, F, Fut>(&self, cancel: &CancellationToken, call: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.policy
            .run(&self.operation, &self.breaker, cancel, call)
            .await
    }
}
