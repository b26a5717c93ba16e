//! Startup retry policy.

use std::time::Duration;

use crate::Error;

const DEFAULT_FIRST_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Decides whether a failed startup attempt is retried and how long to wait first.
///
/// Only retryable errors (network, 5xx, pool timeouts) are retried; authentication and
/// configuration failures end startup on the first attempt. Delays double per attempt
/// up to `max_delay`. With jitter enabled each delay is drawn from its upper half, so
/// replicas restarting together spread their credential fetches.
#[derive(Clone, Debug)]
pub struct StartupRetry {
    attempts: u32,
    first_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl StartupRetry {
    /// At most `attempts` tries in total; zero is treated as one.
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            first_delay: DEFAULT_FIRST_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
        }
    }

    pub fn with_delays(mut self, first: Duration, max: Duration) -> Self {
        self.first_delay = first;
        self.max_delay = max.max(first);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Wait before the next try after `attempt` (1-based) failed with `error`, or
    /// `None` when startup should give up.
    pub fn delay_after(&self, attempt: u32, error: &Error) -> Option<Duration> {
        if !error.is_retryable() || attempt >= self.attempts {
            return None;
        }
        let delay = self.ceiling(attempt);
        if !self.jitter {
            return Some(delay);
        }
        let half = delay / 2;
        let spread = rand::random_range(0..=half.as_millis() as u64);
        Some(half + Duration::from_millis(spread))
    }

    fn ceiling(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.first_delay
            .checked_mul(1u32 << doublings)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for StartupRetry {
    fn default() -> Self {
        Self::new(crate::config::settings::DEFAULT_STARTUP_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> Error {
        Error::fetch("issuer returned HTTP 503")
    }

    #[test]
    fn test_delays_double_up_to_max() {
        let retry = StartupRetry::new(10)
            .with_delays(Duration::from_millis(100), Duration::from_millis(500))
            .without_jitter();

        assert_eq!(retry.delay_after(1, &transient()), Some(Duration::from_millis(100)));
        assert_eq!(retry.delay_after(2, &transient()), Some(Duration::from_millis(200)));
        assert_eq!(retry.delay_after(3, &transient()), Some(Duration::from_millis(400)));
        assert_eq!(retry.delay_after(4, &transient()), Some(Duration::from_millis(500)));
        assert_eq!(retry.delay_after(9, &transient()), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_gives_up_after_attempts() {
        let retry = StartupRetry::new(3).without_jitter();
        assert!(retry.delay_after(2, &transient()).is_some());
        assert_eq!(retry.delay_after(3, &transient()), None);
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let retry = StartupRetry::new(0);
        assert_eq!(retry.attempts(), 1);
        assert_eq!(retry.delay_after(1, &transient()), None);
    }

    #[test]
    fn test_fatal_errors_not_retried() {
        let retry = StartupRetry::new(5);
        assert_eq!(retry.delay_after(1, &Error::authentication("forbidden", Some(403))), None);
        assert_eq!(retry.delay_after(1, &Error::configuration("missing PGHOST")), None);
        assert_eq!(retry.delay_after(1, &Error::ShutDown), None);
    }

    #[test]
    fn test_jitter_stays_in_upper_half() {
        let retry = StartupRetry::new(5)
            .with_delays(Duration::from_millis(400), Duration::from_secs(10));
        for _ in 0..50 {
            let delay = retry.delay_after(2, &transient()).unwrap();
            assert!(delay >= Duration::from_millis(400) && delay <= Duration::from_millis(800));
        }
    }

    #[test]
    fn test_huge_attempt_numbers_saturate() {
        let retry = StartupRetry::new(u32::MAX)
            .with_delays(Duration::from_secs(1), Duration::from_secs(30))
            .without_jitter();
        assert_eq!(retry.delay_after(200, &transient()), Some(Duration::from_secs(30)));
    }
}
