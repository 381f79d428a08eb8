//! The retry schedule for deferred deliveries.
//!
//! Attempt-indexed and fully deterministic: 1, 2, 4, 8, 16, 32 minutes for
//! the first six attempts, then 60, 120 and 240 minutes for everything
//! after. Downstream bookkeeping (and the tests) rely on these exact
//! values.

use std::time::Duration;

const SCHEDULE_MINUTES: [u64; 9] = [1, 2, 4, 8, 16, 32, 60, 120, 240];

/// Delay before the retry following `attempt` (1-based: `attempt = 1` is
/// the delay after the first failed attempt).
#[must_use]
pub fn backoff(attempt: u32) -> Duration {
    let index = (attempt.max(1) as usize - 1).min(SCHEDULE_MINUTES.len() - 1);
    Duration::from_secs(SCHEDULE_MINUTES[index] * 60)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::backoff;

    #[test]
    fn schedule_is_exact() {
        let expected_minutes = [1, 2, 4, 8, 16, 32, 60, 120, 240];
        for (attempt, minutes) in (1..).zip(expected_minutes) {
            assert_eq!(
                backoff(attempt),
                Duration::from_secs(minutes * 60),
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn late_attempts_cap_at_240_minutes() {
        assert_eq!(backoff(10), Duration::from_secs(240 * 60));
        assert_eq!(backoff(100), Duration::from_secs(240 * 60));
    }

    #[test]
    fn attempt_zero_is_treated_as_one() {
        assert_eq!(backoff(0), Duration::from_secs(60));
    }
}
