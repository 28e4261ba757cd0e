//! Retry policy: a pure function from attempt index to backoff delay.
//!
//! No error classification — a config error retries the same as a
//! network error. Classification is a possible future refinement.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Default policy with the job's retry ceiling when it sets one.
    pub fn for_job(max_retries: i32) -> Self {
        let mut policy = Self::default();
        if max_retries > 0 {
            policy.max_retries = max_retries as u32;
        }
        policy
    }

    /// Exponential backoff: `initial * factor^attempt`, capped at
    /// `max_delay`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let delay = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        if delay >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    pub fn should_retry(&self, attempt: u32, failed: bool) -> bool {
        failed && attempt < self.max_retries
    }
}
