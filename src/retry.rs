//! Reconnect retry policy.
//!
//! Tracks how many attempts have been made since the last successful
//! connection and hands out the inter-attempt delay, refusing once the
//! configured budget is exhausted. The delay is constant: reconnection
//! pacing for this protocol is a fixed interval, not an exponential curve.

use std::time::Duration;

use thiserror::Error;

/// Returned when the retry budget is exhausted.
#[derive(Debug, Error, PartialEq)]
pub enum RetryError {
    /// All allowed reconnect attempts since the last successful connection
    /// have been used up.
    #[error("reconnect budget exhausted after {0} attempts")]
    Exhausted(u32),
}

/// Fixed-delay retry policy with an optional attempt budget.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay between consecutive attempts.
    delay: Duration,

    /// Maximum attempts since the last success. `0` means unlimited.
    max_attempts: u32,

    /// Attempts made since the last success.
    attempt: u32,
}

impl RetryPolicy {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
            attempt: 0,
        }
    }

    /// Registers the next attempt and returns the delay to wait before it.
    ///
    /// Fails with `RetryError::Exhausted` once the budget is used up.
    pub fn next_delay(&mut self) -> Result<Duration, RetryError> {
        if self.max_attempts > 0 && self.attempt >= self.max_attempts {
            return Err(RetryError::Exhausted(self.attempt));
        }
        self.attempt += 1;
        Ok(self.delay)
    }

    /// Number of the attempt most recently handed out (1-based).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Resets the attempt counter after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay() {
        let mut policy = RetryPolicy::new(Duration::from_millis(250), 3);

        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(250));
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(250));
        assert_eq!(policy.attempt(), 2);
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut policy = RetryPolicy::new(Duration::from_millis(10), 2);

        assert!(policy.next_delay().is_ok());
        assert!(policy.next_delay().is_ok());
        assert_eq!(policy.next_delay(), Err(RetryError::Exhausted(2)));
        // Stays exhausted until reset.
        assert_eq!(policy.next_delay(), Err(RetryError::Exhausted(2)));
    }

    #[test]
    fn test_reset_restores_budget() {
        let mut policy = RetryPolicy::new(Duration::from_millis(10), 1);

        assert!(policy.next_delay().is_ok());
        assert!(policy.next_delay().is_err());

        policy.reset();
        assert_eq!(policy.attempt(), 0);
        assert!(policy.next_delay().is_ok());
    }

    #[test]
    fn test_zero_means_unlimited() {
        let mut policy = RetryPolicy::new(Duration::from_millis(1), 0);
        for _ in 0..10_000 {
            assert!(policy.next_delay().is_ok());
        }
    }
}
