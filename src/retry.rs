//! Retry Controller
//!
//! Classification-driven retries with exponential backoff and jitter.
//! Transient errors (capacity noise) back off and retry; fatal errors
//! propagate after a single attempt; ambiguous errors get exactly one
//! verification retry so programming mistakes are not masked as load.
//! Backoff sleeps race a cancel token and abort promptly.

use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{ErrorClass, GenError, GenResult};

/// Exponent cap so the uncapped doubling cannot overflow long sequences.
const MAX_BACKOFF_EXPONENT: u32 = 4;

/// Floor applied to jittered delays.
const MIN_JITTERED_DELAY: Duration = Duration::from_secs(1);

// =============================================================================
// CancelToken
// =============================================================================

/// Cooperative cancellation shared across an engine and its operations.
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation has been signalled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            // Register before the re-check so a cancel() between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep that aborts with `GenError::Cancelled` when the token fires.
    pub async fn sleep(&self, duration: Duration) -> GenResult<()> {
        if self.is_cancelled() {
            return Err(GenError::Cancelled);
        }
        tokio::select! {
            _ = self.cancelled() => Err(GenError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Bail out immediately if cancellation has been signalled.
    pub fn check(&self) -> GenResult<()> {
        if self.is_cancelled() {
            Err(GenError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// =============================================================================
// RetryPolicy
// =============================================================================

/// Backoff parameters for the retry controller.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Ceiling on any single delay
    pub max_delay: Duration,
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Jitter fraction applied at sleep time (0.2 = plus/minus 20%)
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            max_attempts: 5,
            jitter_percent: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Fast policy for tests: millisecond delays, no jitter.
    pub fn fast() -> Self {
        Self {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
            max_attempts: 5,
            jitter_percent: 0.0,
        }
    }

    /// Deterministic delay for a 0-based attempt index:
    /// `min(base * 2^min(attempt, 4), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(MAX_BACKOFF_EXPONENT);
        let scaled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent));
        scaled.min(self.max_delay)
    }

    /// Apply jitter to a computed delay. No-op when jitter is disabled.
    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_percent <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng()
            .gen_range(1.0 - self.jitter_percent..=1.0 + self.jitter_percent);
        let jittered = delay.mul_f64(factor);
        jittered.max(MIN_JITTERED_DELAY)
    }
}

// =============================================================================
// RetryController
// =============================================================================

/// Drives an async operation through the retry policy.
#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    cancel: CancelToken,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, cancel: CancelToken) -> Self {
        Self { policy, cancel }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `f` until it succeeds, exhausts the attempt budget, or fails
    /// with a non-retryable error.
    pub async fn run<F, Fut, T>(&self, operation: &str, f: F) -> GenResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = GenResult<T>>,
    {
        let mut unknown_retried = false;
        let mut last_error: Option<GenError> = None;

        for attempt in 0..self.policy.max_attempts {
            self.cancel.check()?;

            match f().await {
                Ok(result) => return Ok(result),
                Err(GenError::Cancelled) => return Err(GenError::Cancelled),
                Err(e) => match e.class() {
                    ErrorClass::Fatal => return Err(e),
                    ErrorClass::Unknown => {
                        if unknown_retried {
                            return Err(e);
                        }
                        unknown_retried = true;
                        debug!(operation, error = %e, "Unclassified error, verifying with one retry");
                        last_error = Some(e);
                    }
                    ErrorClass::Transient => {
                        if attempt + 1 >= self.policy.max_attempts {
                            last_error = Some(e);
                            break;
                        }
                        let delay = self.policy.jittered(self.policy.delay_for(attempt));
                        warn!(
                            operation,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Transient failure, backing off"
                        );
                        last_error = Some(e);
                        self.cancel.sleep(delay).await?;
                    }
                },
            }
        }

        let last = last_error
            .unwrap_or_else(|| GenError::Internal(format!("{} failed with no attempts", operation)));
        Err(GenError::RetryExhausted {
            attempts: self.policy.max_attempts,
            last: Box::new(last),
        })
    }
}
