//! Retry policy for storage calls
//!
//! The policy is a plain value: callers ask it what to do with a failed
//! attempt and act on the answer. Quota errors are never retried here (the
//! crawler skips the folder instead), auth errors trigger a credential
//! refresh, transient errors wait and try again.

use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;

use crate::error::{ErrorKind, StorageError};

/// What the caller should do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Refresh credentials, then retry
    RefreshCredentials,
    /// Sleep, then retry
    RetryAfter(Duration),
    /// Surface the error
    GiveUp,
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts per call, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry of a transient failure
    pub delay: Duration,
    /// Growth factor between retries; 1.0 keeps the delay fixed
    pub multiplier: f64,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// How many credential refreshes one call may trigger
    pub auth_refresh_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            multiplier: 1.0,
            max_delay: Duration::from_secs(30),
            auth_refresh_attempts: 2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            auth_refresh_attempts: 0,
            ..Self::default()
        }
    }

    /// Create an ExponentialBackoff from this policy, without jitter
    pub fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.delay,
            initial_interval: self.delay,
            randomization_factor: 0.0,
            multiplier: self.multiplier.max(1.0),
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Decide how to handle `error` after `attempt` (1-based) failed, given
    /// how many credential refreshes this call has already used
    pub fn decide(&self, error: &StorageError, attempt: u32, refreshes_used: u32) -> RetryDecision {
        match error.kind() {
            ErrorKind::Auth if refreshes_used < self.auth_refresh_attempts => {
                RetryDecision::RefreshCredentials
            }
            ErrorKind::Transient if attempt < self.max_attempts => {
                RetryDecision::RetryAfter(self.delay_for(attempt))
            }
            _ => RetryDecision::GiveUp,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut backoff = self.to_backoff();
        let mut delay = self.delay;
        for _ in 0..attempt.max(1) {
            delay = backoff.next_backoff().unwrap_or(self.max_delay);
        }
        delay.min(self.max_delay)
    }
}
