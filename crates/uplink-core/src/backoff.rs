//! Exponential backoff between upload attempts.
//!
//! [`BackoffPolicy`] is shared by the job runner (delay between runs that
//! returned `Retry`) and the upload worker (how far a failed batch's
//! scheduled time moves forward). [`with_retry`] wraps short in-process
//! operations such as a token refresh.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use uplink_core::BackoffPolicy;
//!
//! let policy = BackoffPolicy::default().jitter(false);
//! assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(30));
//! assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
//! assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(3600));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::Result;

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the computed delay (before jitter).
    pub max_delay: Duration,
    /// Growth factor per attempt (1.0 = constant delay).
    pub multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Short delays for in-process retries of a single request.
    pub fn quick() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set initial delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// `min(initial * multiplier^attempt, max)`, plus up to 25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped_delay = if base_delay.is_finite() {
            base_delay.min(self.max_delay.as_secs_f64())
        } else {
            self.max_delay.as_secs_f64()
        };

        let final_delay = if self.jitter {
            let jitter_factor = 1.0 + (rand::rng().random::<f64>() * 0.25);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay.max(0.0))
    }

    /// [`BackoffPolicy::delay_for_attempt`] in whole milliseconds.
    pub fn delay_millis(&self, attempt: u32) -> i64 {
        i64::try_from(self.delay_for_attempt(attempt).as_millis()).unwrap_or(i64::MAX)
    }
}

/// Execute an async operation, retrying transient failures.
///
/// Errors for which [`Error::is_retryable`](crate::Error::is_retryable) is
/// false are returned immediately.
pub async fn with_retry<F, Fut, T>(
    policy: &BackoffPolicy,
    max_retries: u32,
    operation_name: &str,
    operation: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("{} succeeded after {} retries", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation_name,
                    attempt + 1,
                    max_retries + 1,
                    delay,
                    e
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
