//! Retry decisions for failed task attempts.
//!
//! Pure and stateless: the scheduler tracks attempt counts and asks
//! [`RetryManager::decide`] what to do after each failure.

use std::time::Duration;

use cascade_types::workflow::{BackoffStrategy, RetryPolicy};

// ---------------------------------------------------------------------------
// RetryDecision
// ---------------------------------------------------------------------------

/// Outcome of consulting the retry policy after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-attempt the task after the given delay.
    Retry(Duration),
    /// No retries left; the task fails.
    GiveUp,
}

// ---------------------------------------------------------------------------
// RetryManager
// ---------------------------------------------------------------------------

/// Stateless retry manager. All logic lives in associated functions that
/// take the policy as a parameter.
pub struct RetryManager;

impl RetryManager {
    /// Decide whether to retry.
    ///
    /// `attempt` is the 1-based number of the retry being requested, which is
    /// also the number of failures so far. Retries are granted while
    /// `attempt <= policy.max_retries`.
    pub fn decide(policy: &RetryPolicy, attempt: u32) -> RetryDecision {
        if attempt == 0 || attempt > policy.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(Self::delay_for(policy, attempt))
    }

    /// Backoff delay before retry number `attempt` (1-based).
    ///
    /// Exponential delays are `base * 2^(attempt - 1)`, saturating, and capped
    /// by `max_delay` when one is set.
    pub fn delay_for(policy: &RetryPolicy, attempt: u32) -> Duration {
        let base = policy.base_delay_ms;
        let raw_ms = match policy.backoff {
            BackoffStrategy::None | BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => {
                let exp = attempt.saturating_sub(1);
                let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
        };
        let capped = match policy.max_delay_ms {
            Some(max) => raw_ms.min(max),
            None => raw_ms,
        };
        Duration::from_millis(capped)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
