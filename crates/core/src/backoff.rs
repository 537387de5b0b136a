//! Exponential backoff shared by provider and tool retries.

use std::time::Duration;

/// Retry budget with capped exponential delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Backoff {
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::new(0, 0, 0)
    }

    /// Delay before retry `n` (1-based): `base * 2^(n-1)`, capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(retry - 1);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(3, 1000, 8000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_then_caps() {
        let b = Backoff::new(5, 1000, 5000);
        assert_eq!(b.delay_for(0), Duration::ZERO);
        assert_eq!(b.delay_for(1), Duration::from_secs(1));
        assert_eq!(b.delay_for(2), Duration::from_secs(2));
        assert_eq!(b.delay_for(3), Duration::from_secs(4));
        assert_eq!(b.delay_for(4), Duration::from_secs(5));
        assert_eq!(b.delay_for(40), Duration::from_secs(5));
        assert_eq!(b.attempts(), 6);
    }

    #[test]
    fn none_never_waits() {
        let b = Backoff::none();
        assert_eq!(b.attempts(), 1);
        assert_eq!(b.delay_for(1), Duration::ZERO);
    }
}
