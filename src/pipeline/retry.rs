//! Bounded retry and dead-letter decisions.
//!
//! ```text
//! Delivered -> Ack                      (completed, or degraded and absorbed)
//!           -> Requeue                  (transient, attempt < max_attempts)
//!           -> DeadLetter               (transient on the last attempt, or structural)
//! ```

use super::{StageError, StageOutcome};

/// Default number of delivery attempts for transient failures.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// What the runner does with a delivery once its handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge. `degraded` carries the absorbed failure, if any.
    Ack {
        /// Reason of a degraded outcome.
        degraded: Option<String>,
    },
    /// Nack with requeue for another attempt.
    Requeue {
        /// Failure that triggered the retry.
        reason: String,
    },
    /// Nack without requeue, routing the message to the dead-letter queue.
    DeadLetter {
        /// Recorded on the dead-letter record.
        reason: String,
    },
}

/// Maps handler results and delivery attempts to a [`Disposition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    /// Allow up to `max_attempts` deliveries (minimum one).
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Configured attempt bound.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide the fate of delivery number `attempt` (1-based).
    pub fn decide(&self, result: &Result<StageOutcome, StageError>, attempt: u32) -> Disposition {
        match result {
            Ok(StageOutcome::Completed) => Disposition::Ack { degraded: None },
            Ok(StageOutcome::Degraded { reason }) => Disposition::Ack {
                degraded: Some(reason.clone()),
            },
            Err(StageError::Structural(reason)) => Disposition::DeadLetter {
                reason: format!("invalid message: {reason}"),
            },
            Err(StageError::Transient(reason)) if attempt < self.max_attempts => {
                Disposition::Requeue {
                    reason: reason.clone(),
                }
            }
            Err(StageError::Transient(reason)) => Disposition::DeadLetter {
                reason: format!("retries exhausted after {attempt} attempts: {reason}"),
            },
        }
    }
}
