//! Reconnection policy with exponential backoff.

use std::time::Duration;

use crate::core::{DEFAULT_RECONNECT_BASE, DEFAULT_RECONNECT_CEILING, DEFAULT_RECONNECT_MAX_ATTEMPTS};

/// How the client retries after an unexpected disconnection.
///
/// Attempt `k` (counting from 0) is scheduled after `base × 2^k`, capped at
/// `ceiling`. After `max_attempts` consecutive failures the client gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt.
    pub base: Duration,
    /// Upper bound on any delay.
    pub ceiling: Duration,
    /// Consecutive attempts before giving up; 0 disables reconnection.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_RECONNECT_BASE,
            ceiling: DEFAULT_RECONNECT_CEILING,
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(31);
        self.base.saturating_mul(factor).min(self.ceiling)
    }
}

/// Attempt counter owned by the client task.
#[derive(Debug)]
pub(crate) struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Schedule the next attempt: its index and delay, or `None` once the
    /// policy is exhausted.
    pub(crate) fn next_delay(&mut self) -> Option<(u32, Duration)> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let attempt = self.attempt;
        self.attempt += 1;
        Some((attempt, self.policy.delay_for(attempt)))
    }

    /// Attempts scheduled since the last reset.
    pub(crate) fn attempts(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(100),
            ceiling: Duration::from_secs(1),
            max_attempts: 6,
        }
    }

    #[test]
    fn test_delay_doubles_up_to_ceiling() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(800));
        assert_eq!(p.delay_for(4), Duration::from_secs(1));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_exhausts_and_resets() {
        let mut backoff = Backoff::new(policy());
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(delays.len(), 6);
        assert_eq!(delays[2], (2, Duration::from_millis(400)));
        assert_eq!(backoff.attempts(), 6);
        assert!(backoff.next_delay().is_none());

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some((0, Duration::from_millis(100))));
    }

    #[test]
    fn test_disabled_never_schedules() {
        assert!(Backoff::new(ReconnectPolicy::disabled()).next_delay().is_none());
    }
}
