use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for hard-failure retry behavior.
///
/// Controls how many attempts a job gets before a hard error becomes
/// terminal, and the backoff schedule a queue backend applies between
/// redeliveries.
///
/// # Examples
///
/// ```
/// use spate::RetryPolicy;
///
/// // Shorthand: just a max attempt count (standard delays)
/// let policy: RetryPolicy = 3.into();
/// assert_eq!(policy.max_attempts, 3);
///
/// // Named policies
/// let none = RetryPolicy::NONE;
/// assert_eq!(none.delay_for_attempt(1), None);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try).
    ///
    /// `max_attempts = 3` means the job body may run three times before a
    /// hard error is recorded as terminal.
    pub max_attempts: u32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (caps exponential backoff).
    pub max_delay: Duration,

    /// Multiplier for exponential backoff.
    ///
    /// Each retry delay is `min(initial_delay * multiplier^(attempt-1), max_delay)`.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// No retries, the first hard error is terminal.
    pub const NONE: Self = Self {
        max_attempts: 1,
        initial_delay: Duration::from_secs(0),
        max_delay: Duration::from_secs(0),
        backoff_multiplier: 1.0,
    };

    /// Standard retry policy.
    ///
    /// - Max attempts: 3 (initial try + 2 retries)
    /// - Initial delay: 1 second
    /// - Max delay: 30 seconds
    /// - Backoff: exponential (2x each time)
    pub const STANDARD: Self = Self {
        max_attempts: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
    };

    /// Create a policy with custom max_attempts and standard delays.
    pub const fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Calculate the delay before the next retry attempt.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The attempt that just failed (1-indexed)
    ///
    /// # Returns
    ///
    /// Duration to wait before the next attempt, or `None` if the budget
    /// is exhausted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        // attempt=1 (first retry): multiplier^0 -> initial_delay
        // attempt=2 (second retry): multiplier^1 -> initial_delay * multiplier
        let exponent = (attempt - 1) as f64;
        let multiplier = self.backoff_multiplier.powf(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;

        Some(Duration::from_secs_f64(
            delay_secs.min(self.max_delay.as_secs_f64()),
        ))
    }
}

impl Default for RetryPolicy {
    /// Default is NONE: a job without an explicit policy gets no retries.
    fn default() -> Self {
        Self::NONE
    }
}

impl From<u32> for RetryPolicy {
    /// Enables the shorthand `retry: 3.into()` with standard delays.
    fn from(max_attempts: u32) -> Self {
        Self::with_max_attempts(max_attempts)
    }
}
