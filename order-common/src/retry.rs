use std::time;

use crate::config::RetryPolicyConfig;

#[derive(Copy, Clone, Debug)]
/// Exponential backoff between attempts to reach a flaky dependency.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Calculate how long to wait before the given retry. `attempt` counts
    /// the attempts already made, starting at 0 for the first retry.
    pub fn time_until_next_retry(
        &self,
        attempt: u32,
        preferred_retry_interval: Option<time::Duration>,
    ) -> time::Duration {
        let candidate_interval = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(attempt));

        match (preferred_retry_interval, self.maximum_interval) {
            (Some(duration), Some(max_interval)) => std::cmp::min(
                std::cmp::max(std::cmp::min(candidate_interval, max_interval), duration),
                max_interval,
            ),
            (Some(duration), None) => std::cmp::max(candidate_interval, duration),
            (None, Some(max_interval)) => std::cmp::min(candidate_interval, max_interval),
            (None, None) => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(100),
            maximum_interval: Some(time::Duration::from_secs(10)),
        }
    }
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(config: &RetryPolicyConfig) -> Self {
        RetryPolicy::new(
            config.backoff_coefficient,
            config.initial_interval.0,
            Some(config.maximum_interval.0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_until_maximum() {
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_millis(100),
            Some(time::Duration::from_secs(1)),
        );

        assert_eq!(
            policy.time_until_next_retry(0, None),
            time::Duration::from_millis(100)
        );
        assert_eq!(
            policy.time_until_next_retry(2, None),
            time::Duration::from_millis(400)
        );
        assert_eq!(
            policy.time_until_next_retry(10, None),
            time::Duration::from_secs(1)
        );
        // large attempt counts saturate instead of overflowing
        assert_eq!(
            policy.time_until_next_retry(u32::MAX, None),
            time::Duration::from_secs(1)
        );
    }

    #[test]
    fn test_preferred_interval_is_capped() {
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_millis(100),
            Some(time::Duration::from_secs(1)),
        );

        assert_eq!(
            policy.time_until_next_retry(0, Some(time::Duration::from_millis(500))),
            time::Duration::from_millis(500)
        );
        assert_eq!(
            policy.time_until_next_retry(0, Some(time::Duration::from_secs(30))),
            time::Duration::from_secs(1)
        );
    }
}
