use crate::core::engine::executor::ExitResult;
use crate::core::engine::plan::{BackoffKind, RetryPolicySpec};
use crate::core::error::AppError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Bounded retry with backoff around a single action invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: BackoffKind,
    min_delay: Duration,
    max_delay: Duration,
}

/// Final attempt's result plus how many attempts were made.
#[derive(Debug, Clone)]
pub struct RetryReport {
    pub result: ExitResult,
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::single_attempt()
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        backoff: BackoffKind,
        min_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }

    pub fn single_attempt() -> Self {
        Self::new(1, BackoffKind::Constant, Duration::ZERO, Duration::ZERO)
    }

    pub fn from_spec(spec: Option<&RetryPolicySpec>) -> Self {
        match spec {
            Some(spec) => Self::new(spec.max_attempts, spec.backoff, spec.min_delay, spec.max_delay),
            None => Self::single_attempt(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay slept before retry number `retry` (1-based), clamped to [min_delay, max_delay].
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let raw = match self.backoff {
            BackoffKind::Constant => self.min_delay,
            BackoffKind::Linear => self.min_delay.saturating_mul(retry),
            BackoffKind::Exponential => match 2u32.checked_pow(retry - 1) {
                Some(factor) => self.min_delay.saturating_mul(factor),
                None => self.max_delay,
            },
        };
        raw.clamp(self.min_delay, self.max_delay)
    }

    /// The unbounded backoff schedule, one entry per retry.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1u32..).map(move |retry| self.delay_for(retry))
    }

    /// Invoke up to `max_attempts` times, sleeping between failed attempts.
    ///
    /// Timed-out attempts count as failures and are retried. Cancelling
    /// `interrupt` stops both the backoff sleep and further attempts.
    pub async fn execute<F, Fut>(
        &self,
        interrupt: &CancellationToken,
        mut invoke: F,
    ) -> RetryReport
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<ExitResult, AppError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = invoke(attempt)
                .await
                .unwrap_or_else(|err| ExitResult::not_started(started.elapsed(), err.to_string()));

            if result.is_success() || result.interrupted || attempt >= self.max_attempts {
                return RetryReport {
                    result,
                    attempts: attempt,
                };
            }

            let delay = self.delay_for(attempt);
            tracing::warn!(
                event = "attempt_failed",
                attempt,
                max_attempts = self.max_attempts,
                exit_code = result.exit_code.unwrap_or(-1),
                timed_out = result.timed_out,
                delay_ms = delay.as_millis() as u64,
                "attempt failed; retrying"
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = interrupt.cancelled() => {
                    return RetryReport {
                        result,
                        attempts: attempt,
                    };
                }
            }
        }
    }
}
