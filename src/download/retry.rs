use crate::error::BittorrentError;
use rand::Rng;
use std::time::Duration;

/// Delay between consecutive dial attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

/// Bounded reconnection policy for one peer address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total dial attempts, including the first
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Upper bound of the random delay added before every attempt
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(500),
                max: Duration::from_secs(5),
            },
            jitter: Duration::from_millis(400),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no delays
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed(Duration::ZERO),
            jitter: Duration::ZERO,
        }
    }

    /// Whether attempt number `attempt` (1-based) failing with `error`
    /// deserves another try
    pub fn should_retry(&self, attempt: u32, error: &BittorrentError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }

    /// Wait after failed attempt number `attempt` (1-based)
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }

    /// Random pre-dial delay, spreading simultaneous dials apart
    pub fn jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let millis = self.jitter.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}
