//! Bounded exponential backoff for fallible async operations.
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::errors::ChatError;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);
const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(10_000);
const DEFAULT_BACKOFF_FACTOR: u32 = 2;

/// Progress of the operation currently being retried.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempts_made: u32,
    pub is_retrying: bool,
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: u32,
    state: Arc<Mutex<RetryState>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_ATTEMPTS,
            DEFAULT_INITIAL_DELAY,
            DEFAULT_MAX_DELAY,
            DEFAULT_BACKOFF_FACTOR,
        )
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: u32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
            backoff_factor,
            state: Arc::new(Mutex::new(RetryState::default())),
        }
    }

    /// Wait after the failed attempt number `attempt` (zero based):
    /// `min(initial_delay * backoff_factor^attempt, max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.saturating_pow(attempt);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Same settings with its own attempt state, for running
    /// operations concurrently.
    pub fn detached(&self) -> Self {
        Self::new(
            self.max_attempts,
            self.initial_delay,
            self.max_delay,
            self.backoff_factor,
        )
    }

    pub fn state(&self) -> RetryState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, attempts_made: u32, is_retrying: bool) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = RetryState {
            attempts_made,
            is_retrying,
        };
    }

    /// Run `operation` until it succeeds, fails with a non retryable
    /// error, runs out of attempts or `cancel` fires. Every failed
    /// attempt is logged with `label` as the context.
    pub async fn retry<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, ChatError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChatError>>,
    {
        let mut attempt = 0;
        loop {
            self.set_state(attempt + 1, true);

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(ChatError::Cancelled),
                res = operation() => res,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(
                            context = label,
                            attempt = attempt + 1,
                            total_attempts = self.max_attempts,
                            "Operation succeeded after retry"
                        );
                    }
                    self.set_state(0, false);
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                self.set_state(0, false);
                return Err(err);
            }

            tracing::warn!(
                context = label,
                error = %err,
                attempt = attempt + 1,
                total_attempts = self.max_attempts,
                "Operation failed, attempting retry"
            );

            if attempt + 1 >= self.max_attempts {
                self.set_state(0, false);
                tracing::error!(
                    context = label,
                    error = %err,
                    attempts = self.max_attempts,
                    "Operation failed after all retry attempts"
                );
                return Err(ChatError::RetryExhausted {
                    attempts: self.max_attempts,
                    last: Box::new(err),
                });
            }

            let delay = self.delay_for(attempt);
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_state(0, false);
                    return Err(ChatError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
