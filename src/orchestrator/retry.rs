use std::time::Duration;

use crate::config::RetrySettings;

/// Stage retry policy: bounded attempts with capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.base_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
        )
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// `base * 2^attempt`, capped at `max_delay`. `attempt` is the 0-based index
    /// of the attempt that just failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// What to do after `attempts_made` attempts of a stage, the last of which failed.
    pub fn decide(&self, attempts_made: u32, retryable: bool) -> RetryDecision {
        if !retryable || attempts_made >= self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.delay_for(attempts_made.saturating_sub(1)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(4, Duration::from_millis(100), Duration::from_millis(1_000))
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(800));
        assert_eq!(p.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_decide_respects_attempt_limit() {
        let p = policy();
        assert_eq!(p.decide(1, true), RetryDecision::RetryAfter(Duration::from_millis(100)));
        assert_eq!(p.decide(3, true), RetryDecision::RetryAfter(Duration::from_millis(400)));
        assert_eq!(p.decide(4, true), RetryDecision::GiveUp);
    }

    #[test]
    fn test_non_retryable_gives_up_immediately() {
        assert_eq!(policy().decide(1, false), RetryDecision::GiveUp);
    }

    #[test]
    fn test_every_attempt_sequence_terminates() {
        let p = policy();
        let mut attempts = 0;
        loop {
            attempts += 1;
            if p.decide(attempts, true) == RetryDecision::GiveUp {
                break;
            }
        }
        assert_eq!(attempts, p.max_attempts);
    }
}
