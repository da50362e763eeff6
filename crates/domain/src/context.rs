//! Request-scoped deadline and cancellation.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why an [`ExecContext`] stopped an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Carries an optional deadline and a cancellation token through an operation.
///
/// Clones share the token, so cancelling one cancels every clone.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl ExecContext {
    /// A context with no deadline and a fresh token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the deadline to `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Sets an absolute deadline, keeping the earlier one if already set.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Replaces the cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancels this context and every clone of it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails if the context is already cancelled or past its deadline.
    pub fn check(&self) -> Result<(), ContextError> {
        if self.cancel.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Err(ContextError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Sleeps for `duration` unless the context ends first.
    ///
    /// Returns [`ContextError::DeadlineExceeded`] without sleeping when the
    /// deadline falls inside the sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        self.check()?;

        let wake = Instant::now() + duration;
        if self.deadline.is_some_and(|deadline| deadline <= wake) {
            return Err(ContextError::DeadlineExceeded);
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(ContextError::Cancelled),
            _ = tokio::time::sleep_until(wake) => Ok(()),
        }
    }

    /// Drives `future` to completion unless the context ends first.
    ///
    /// The future is dropped when the context ends, which releases anything
    /// it owns (an open transaction rolls back).
    pub async fn run<T, E, F>(&self, future: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<ContextError>,
    {
        self.check()?;

        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => Err(ContextError::Cancelled.into()),
                outcome = tokio::time::timeout_at(deadline, future) => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(ContextError::DeadlineExceeded.into()),
                },
            },
            None => tokio::select! {
                _ = self.cancel.cancelled() => Err(ContextError::Cancelled.into()),
                result = future => result,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_deadline() {
        let ctx = ExecContext::new();
        let start = Instant::now();
        ctx.sleep(Duration::from_millis(250)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_past_deadline_fails_immediately() {
        let ctx = ExecContext::new().with_timeout(Duration::from_millis(100));
        let start = Instant::now();
        let result = ctx.sleep(Duration::from_secs(10)).await;
        assert_eq!(result, Err(ContextError::DeadlineExceeded));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_within_deadline_completes() {
        let ctx = ExecContext::new().with_timeout(Duration::from_secs(1));
        let start = Instant::now();
        ctx.sleep(Duration::from_millis(200)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_sleep() {
        let ctx = ExecContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let result = ctx.sleep(Duration::from_secs(60)).await;
        assert_eq!(result, Err(ContextError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn check_reports_cancelled_first() {
        let ctx = ExecContext::new().with_deadline(Instant::now());
        ctx.cancel();
        assert_eq!(ctx.check(), Err(ContextError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn run_times_out_slow_futures() {
        let ctx = ExecContext::new().with_timeout(Duration::from_millis(50));
        let result: Result<(), ContextError> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn run_passes_results_through() {
        let ctx = ExecContext::new();
        let result: Result<u32, ContextError> = ctx.run(async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[test]
    fn earlier_deadline_wins() {
        let now = Instant::now();
        let ctx = ExecContext::new()
            .with_deadline(now + Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(5));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }
}
