//! Backoff for transient task failures.

use std::time::Duration;

use rand::Rng;

use crate::config::QueueConfig;

/// Exponential backoff with jitter and an attempt cap.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    /// Total deliveries allowed, including the first.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay,
            max_attempts,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.retry_base, config.retry_max, config.max_attempts)
    }

    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before the next delivery, or `None` once attempts are used up.
    ///
    /// Jitter draws from the upper half of the backoff window. A provider
    /// hint wins when it asks for a longer wait.
    pub fn next_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let ceiling = self.backoff(attempt);
        let floor = ceiling / 2;
        let jittered = if ceiling > floor {
            rand::thread_rng().gen_range(floor..=ceiling)
        } else {
            ceiling
        };
        Some(match retry_after {
            Some(hint) if hint > jittered => hint,
            _ => jittered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(300), 5)
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_secs(30));
        assert_eq!(p.backoff(2), Duration::from_secs(60));
        assert_eq!(p.backoff(3), Duration::from_secs(120));
        assert_eq!(p.backoff(4), Duration::from_secs(240));
        assert_eq!(p.backoff(5), Duration::from_secs(300));
        assert_eq!(p.backoff(60), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_in_upper_half() {
        let p = policy();
        for _ in 0..100 {
            let d = p.next_delay(2, None).unwrap();
            assert!(d >= Duration::from_secs(30) && d <= Duration::from_secs(60));
        }
    }

    #[test]
    fn longer_hint_wins() {
        let p = policy();
        assert_eq!(
            p.next_delay(1, Some(Duration::from_secs(900))),
            Some(Duration::from_secs(900))
        );
        assert!(p.next_delay(1, Some(Duration::from_secs(1))).unwrap() >= Duration::from_secs(15));
    }

    #[test]
    fn attempts_are_capped() {
        let p = policy();
        assert!(p.next_delay(4, None).is_some());
        assert!(p.next_delay(5, None).is_none());
    }
}
