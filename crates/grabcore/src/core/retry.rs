//! Backoff policy for interrupted fetches.
//!
//! Delays grow exponentially from `initial_delay`, are capped at
//! `max_delay` and get up to 25% jitter unless disabled. Errors opt in to
//! retries through `Retryable`.

use std::time::Duration;

use crate::core::config;

/// Retry strategy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, first try included
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(config::retry::MAX_BACKOFF_SECS),
            backoff_multiplier: config::retry::EXPONENTIAL_BACKOFF_BASE,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy for interrupted fetches, read from the environment.
    pub fn fetch() -> Self {
        Self {
            max_attempts: (*config::retry::FETCH_MAX_ATTEMPTS).max(1),
            initial_delay: config::retry::base_delay(),
            ..Self::default()
        }
    }

    /// Sets the total number of attempts.
    #[must_use]
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    #[must_use]
    pub fn no_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Delay to wait after the failed attempt number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.add_jitter {
            // Up to 25% jitter
            let jitter = rand::random::<f64>() * 0.25 * capped_delay;
            capped_delay + jitter
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay.max(0.0))
    }
}

/// Errors that know whether another attempt can help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Server-provided wait before the next attempt, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}
