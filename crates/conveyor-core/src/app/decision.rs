//! Decision model: what the acknowledgement layer does with a failed delivery.
//!
//! - Permanent なエラーは即 dead-letter
//! - それ以外は `RetryPolicy` の上限まで backoff 付きで requeue

use std::time::Duration;

use super::retry::RetryPolicy;
use crate::domain::{DispatchError, ErrorKind};

/// The next action for a delivery whose dispatch failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Put the message back, visible again after `delay`.
    Retry { delay: Duration, reason: String },

    /// Give up and dead-letter the message.
    MarkDead { reason: String },
}

/// Pure function from (attempt, failure) to the next action.
///
/// Executing the decision (requeue, dead-letter, bookkeeping) is the
/// worker's job.
pub trait Decider: Send + Sync {
    /// `attempt` is the 1-indexed delivery count of the failed delivery.
    fn decide(&self, attempt: u32, error: &DispatchError) -> Decision;
}

/// Attempt-based retry with exponential backoff.
///
/// - Permanent failures are dead-lettered at once
/// - Otherwise retry until `max_attempts` deliveries have been made
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, attempt: u32, error: &DispatchError) -> Decision {
        if error.kind() == ErrorKind::Permanent {
            return Decision::MarkDead {
                reason: format!("permanent failure: {error}"),
            };
        }
        if self.retry_policy.is_exhausted(attempt) {
            return Decision::MarkDead {
                reason: format!(
                    "max attempts reached ({attempt}/{}): {error}",
                    self.retry_policy.max_attempts
                ),
            };
        }
        let delay = self.retry_policy.next_delay(attempt);
        Decision::Retry {
            delay,
            reason: format!(
                "retry attempt {}/{} after {:?}: {error}",
                attempt + 1,
                self.retry_policy.max_attempts,
                delay
            ),
        }
    }
}
