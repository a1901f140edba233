//! Startup connection retry.
//!
//! The service does not start serving until both backing stores answer. Each
//! connection is attempted up to `max_attempts` times with a delay between
//! attempts; exhausting the attempts is fatal to the caller.
//!
//! # Example
//!
//! ```rust
//! use outbox_runtime::retry::{RetryPolicy, retry_connect};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .initial_delay(Duration::from_millis(10))
//!     .build();
//!
//! let pool = retry_connect("postgres", &policy, || async { Ok::<_, String>(42) }).await?;
//! assert_eq!(pool, 42);
//! # Ok(())
//! # }
//! ```

use crate::metrics::StartupMetrics;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy for startup connections.
///
/// # Default Values
///
/// - `max_attempts`: 5
/// - `initial_delay`: 2 seconds
/// - `max_delay`: 30 seconds
/// - `multiplier`: 1.0 (fixed delay)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: usize,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Cap on the delay between attempts
    pub max_delay: Duration,
    /// Growth factor of the delay per failed attempt
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 1.0,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Delay after the failed attempt with zero-based index `attempt`.
    ///
    /// `initial_delay * multiplier ^ attempt`, capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(delay_ms as u64);

        delay.min(self.max_delay)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Set total attempts. Values below one are treated as one.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.policy.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the delay after the first failure.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Connect to `target`, retrying per `policy`.
///
/// Every attempt is logged as `attempt i/N` and counted in
/// `startup_connect_attempts_total`.
///
/// # Errors
///
/// Returns the last error once all attempts have failed.
pub async fn retry_connect<F, Fut, T, E>(
    target: &'static str,
    policy: &RetryPolicy,
    mut connect: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        StartupMetrics::record_connect_attempt(target);

        match connect().await {
            Ok(conn) => {
                tracing::info!(target_name = target, attempt, max_attempts, "Connected");
                return Ok(conn);
            }
            Err(err) if attempt >= max_attempts => {
                tracing::error!(
                    target_name = target,
                    attempt,
                    max_attempts,
                    error = %err,
                    "Giving up connecting"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt - 1);
                tracing::warn!(
                    target_name = target,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Connection attempt {attempt}/{max_attempts} failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn default_is_five_attempts_two_seconds_apart() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
    }

    #[test]
    fn exponential_delay_is_capped() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(1000))
            .multiplier(10.0)
            .max_delay(Duration::from_secs(2))
            .build();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let started = tokio::time::Instant::now();
        let result = retry_connect("postgres", &RetryPolicy::default(), || {
            let c = Arc::clone(&counter);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("connection refused")
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_connect("redis", &RetryPolicy::default(), || {
            let c = Arc::clone(&counter);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("connection refused")
            }
        })
        .await;

        assert_eq!(result, Err("connection refused"));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn builder_clamps_attempts_to_one() {
        assert_eq!(RetryPolicy::builder().max_attempts(0).build().max_attempts, 1);
    }
}
