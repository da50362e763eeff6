//! Classified retry with exponential backoff and jitter.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use storage::{Classify, ErrorClass};

use crate::context::{ContextError, ExecContext};

/// Jittered delays fall within this fraction of the base delay, either way.
const JITTER_RATIO: f64 = 0.2;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// When false, operations run exactly once
    pub enabled: bool,
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay, before jitter
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Randomize each delay by up to ±20%
    pub jitter: bool,
    pub retry_on_conflict: bool,
    pub retry_on_deadlock: bool,
    pub retry_on_lock_timeout: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            jitter: true,
            retry_on_conflict: true,
            retry_on_deadlock: true,
            retry_on_lock_timeout: true,
        }
    }
}

impl RetryConfig {
    /// A config that never retries.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Decides whether a failed operation is worth repeating, and when.
#[derive(Clone, Debug, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Classifies an error as retryable.
    ///
    /// Connection loss is always retryable. Conflicts, deadlocks and lock
    /// timeouts follow their config flags. Everything else, duplicate keys
    /// included, is final.
    pub fn is_retryable<E: Classify + ?Sized>(&self, err: &E) -> bool {
        match err.class() {
            ErrorClass::ConcurrentModification => self.config.retry_on_conflict,
            ErrorClass::Deadlock => self.config.retry_on_deadlock,
            ErrorClass::LockTimeout => self.config.retry_on_lock_timeout,
            ErrorClass::ConnectionLost => true,
            ErrorClass::NotFound
            | ErrorClass::Validation
            | ErrorClass::Duplicate
            | ErrorClass::Other => false,
        }
    }

    /// Returns true if `result` failed with a retryable error.
    pub fn should_retry<T, E: Classify>(&self, result: &Result<T, E>) -> bool {
        match result {
            Ok(_) => false,
            Err(err) => self.is_retryable(err),
        }
    }

    /// Backoff before jitter: `min(initial_delay * backoff_factor^(attempt-1), max_delay)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled =
            self.config.initial_delay.as_secs_f64() * self.config.backoff_factor.powi(exponent);
        let capped = scaled.min(self.config.max_delay.as_secs_f64()).max(0.0);
        Duration::try_from_secs_f64(capped).unwrap_or(self.config.max_delay)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn compute_backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.config.jitter {
            return base;
        }

        let factor = rand::rng().random_range((1.0 - JITTER_RATIO)..=(1.0 + JITTER_RATIO));
        Duration::try_from_secs_f64((base.as_secs_f64() * factor).max(0.0)).unwrap_or(base)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts.
    ///
    /// The closure receives the 1-based attempt number. Waits between attempts
    /// end early when `ctx` is cancelled or reaches its deadline, in which case
    /// the context error is returned instead of the last failure.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        ctx: &ExecContext,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + From<ContextError> + Display,
    {
        if !self.config.enabled {
            return operation(1).await;
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !self.is_retryable(&error) {
                tracing::debug!(attempt, error = %error, "non-retryable failure");
                return Err(error);
            }

            if attempt >= max_attempts {
                tracing::error!(attempt, error = %error, "operation failed after all retries");
                return Err(error);
            }

            let delay = self.compute_backoff(attempt);
            tracing::warn!(
                attempt,
                max_attempts,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "transient failure, retrying after delay"
            );
            metrics::counter!("uow_retries_total").increment(1);

            ctx.sleep(delay).await?;
        }
    }
}
