use crate::config::RecoveryConfig;
use std::time::Duration;

/// Delay schedule for retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub exponential: bool,
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped at `max`
    pub fn delay(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.base.min(self.max);
        }

        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// How the capture loop reacts to a failing camera
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Read failures tolerated in a row before the source is closed
    pub max_consecutive_failures: u32,
    /// Reopen attempts before giving up, 0 for unlimited
    pub max_recovery_attempts: u32,
    pub reopen: Backoff,
}

impl RecoveryPolicy {
    /// Backoff for in-place read retries, starting at one frame budget
    pub fn read_retry(&self, frame_budget: Duration) -> Backoff {
        Backoff {
            base: frame_budget,
            max: self.reopen.max,
            exponential: true,
        }
    }

    pub fn attempts_exhausted(&self, attempts: u32) -> bool {
        self.max_recovery_attempts != 0 && attempts >= self.max_recovery_attempts
    }
}

impl From<&RecoveryConfig> for RecoveryPolicy {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            max_consecutive_failures: config.max_consecutive_failures,
            max_recovery_attempts: config.max_recovery_attempts,
            reopen: Backoff {
                base: Duration::from_millis(config.base_delay_ms),
                max: Duration::from_millis(config.max_delay_ms),
                exponential: config.exponential_backoff,
            },
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from(&RecoveryConfig::default())
    }
}
