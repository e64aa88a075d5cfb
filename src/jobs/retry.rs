//! Retry policy: decides whether a failed job is retried and after how long.

use std::time::Duration;

/// Default multiplier for exponential backoff.
pub const DEFAULT_BACKOFF_BASE: u32 = 2;

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back in `pending`, eligible again after `delay`.
    Retry { delay: Duration },
    /// Move the job to the dead-letter queue.
    DeadLetter,
}

/// Exponential backoff: a job that has failed `n` times waits `base^n` seconds.
///
/// There is no upper bound on the delay; `max_retries` is the only ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff_base: u32,
}

impl RetryPolicy {
    pub fn new(backoff_base: u32) -> Self {
        Self { backoff_base }
    }

    /// Delay before the next attempt once `attempts` failures have been counted.
    ///
    /// Saturates at `u64::MAX` seconds instead of overflowing.
    pub fn delay(&self, attempts: u32) -> Duration {
        let secs = u64::from(self.backoff_base)
            .checked_pow(attempts)
            .unwrap_or(u64::MAX);
        Duration::from_secs(secs)
    }

    /// Decide the fate of a job whose attempt counter was just incremented
    /// to `attempts`.
    pub fn decide(&self, attempts: u32, max_retries: u32) -> RetryDecision {
        if attempts > max_retries {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Retry {
                delay: self.delay(attempts),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_base_to_the_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));

        let policy = RetryPolicy::new(3);
        assert_eq!(policy.delay(2), Duration::from_secs(9));
    }

    #[test]
    fn zero_base_retries_immediately() {
        let policy = RetryPolicy::new(0);
        assert_eq!(policy.delay(1), Duration::ZERO);
        assert_eq!(
            policy.decide(1, 2),
            RetryDecision::Retry {
                delay: Duration::ZERO
            }
        );
    }

    #[test]
    fn huge_exponent_saturates() {
        let policy = RetryPolicy::new(10);
        assert_eq!(policy.delay(200), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn zero_max_retries_is_terminal_on_first_failure() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(1, 0), RetryDecision::DeadLetter);
    }

    #[test]
    fn dead_after_exactly_max_plus_one_failures() {
        let policy = RetryPolicy::default();
        let max_retries = 3;
        let mut attempts = 0;
        loop {
            attempts += 1;
            if policy.decide(attempts, max_retries) == RetryDecision::DeadLetter {
                break;
            }
        }
        assert_eq!(attempts, max_retries + 1);
    }
}
