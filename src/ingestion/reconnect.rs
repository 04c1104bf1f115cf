//! Pure reconnection policy

use std::time::Duration;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Per-attempt delays in milliseconds, used before `sustained_delay`
    pub backoff_pattern: Vec<u64>,
    /// Delay in milliseconds once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: Vec::new(),
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Fixed delay between every attempt, retrying forever
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: Vec::new(),
            sustained_delay: delay.as_millis() as u64,
        }
    }

    /// Delay before the given (1-based) attempt
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    /// Decide whether to try again after `failed_attempts` consecutive failures
    pub fn decide(&self, failed_attempts: u32, shutdown_requested: bool) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = self.max_attempts {
            if failed_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        ReconnectionDecision::Proceed {
            attempt: failed_attempts + 1,
            delay_ms: self.calculate_backoff_delay(failed_attempts + 1),
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}
