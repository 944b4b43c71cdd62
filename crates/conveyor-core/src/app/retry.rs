//! Retry policy: decides backoff delays.

use std::time::Duration;

use crate::config::RetrySettings;

/// Longest backoff ever returned, whatever the attempt count.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Retry policy for failed deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first redelivery.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Total deliveries allowed, the first one included.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_attempts: u32) -> Self {
        Self {
            base_delay,
            multiplier,
            max_attempts,
        }
    }

    /// Delay before redelivering after `attempts` failed deliveries (1-indexed).
    ///
    /// delay = base_delay * multiplier^(attempts - 1), capped at [`MAX_BACKOFF`].
    /// With base_delay=2s, multiplier=2.0: 2s, 4s, 8s, 16s, 32s.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay_secs)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), 2.0, 5)
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(
            Duration::from_millis(settings.base_delay_ms),
            settings.multiplier,
            settings.max_attempts,
        )
    }
}
