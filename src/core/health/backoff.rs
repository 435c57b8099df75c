use std::time::Duration;

use crate::core::config::RestartSettings;

/// `base * 2^attempt`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn from_settings(settings: &RestartSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.base_delay_seconds),
            Duration::from_secs(settings.max_delay_seconds),
        )
    }

    /// Delay before the restart that follows `consecutive_restarts` earlier
    /// ones.
    pub fn delay(&self, consecutive_restarts: u32) -> Duration {
        let factor = 1u32.checked_shl(consecutive_restarts).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn doubles_from_the_base() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(300));
        let delays: Vec<u64> = (0..10).map(|n| backoff.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300]);
    }

    #[test]
    fn huge_attempt_counts_saturate_at_the_cap() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(backoff.delay(40), Duration::from_secs(60));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(60));
    }

    proptest! {
        #[test]
        fn delays_never_decrease_and_respect_the_cap(
            base in 0u64..120,
            cap in 0u64..3600,
            attempts in 1u32..64,
        ) {
            let backoff = Backoff::new(Duration::from_secs(base), Duration::from_secs(cap));
            let mut previous = Duration::ZERO;
            for n in 0..attempts {
                let delay = backoff.delay(n);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_secs(cap));
                previous = delay;
            }
        }
    }
}
