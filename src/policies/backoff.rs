//! # Backoff between plugin restarts.
//!
//! Delays grow exponentially with the restart count and are capped:
//!
//! ```text
//! delay = min(5 min, 10 s · 2^max(restarts, 0))
//! ```
//!
//! clamped to a positive floor of 1 s. A plugin that ran stably for longer
//! than [`STABLE_RUN_RESET`] has its `restarts` counter reset to zero before
//! the delay is computed, so a long-lived plugin that finally crashes retries
//! quickly instead of inheriting an old penalty.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use synagent::policies::backoff::restart_delay;
//!
//! assert_eq!(restart_delay(0), Duration::from_secs(10));
//! assert_eq!(restart_delay(3), Duration::from_secs(80));
//! assert_eq!(restart_delay(10), Duration::from_secs(300)); // capped
//! assert_eq!(restart_delay(-5), Duration::from_secs(10));  // floored exponent
//! ```

use std::time::Duration;

/// Base delay for the first restart.
pub const BASE_DELAY: Duration = Duration::from_secs(10);

/// Hard cap on any computed delay.
pub const MAX_DELAY: Duration = Duration::from_secs(5 * 60);

/// Positive floor; a zero delay would busy-loop a crashing plugin.
pub const MIN_DELAY: Duration = Duration::from_secs(1);

/// Running phases at least this long reset the restart streak.
pub const STABLE_RUN_RESET: Duration = Duration::from_secs(10 * 60);

/// Computes the delay before the next restart attempt.
pub fn restart_delay(restarts: i64) -> Duration {
    // 2^32 already exceeds the cap by far; clamping the exponent keeps the
    // shift defined for any counter value.
    let exp = restarts.clamp(0, 32) as u32;
    let secs = BASE_DELAY.as_secs().saturating_mul(1u64 << exp);
    Duration::from_secs(secs.clamp(MIN_DELAY.as_secs(), MAX_DELAY.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_from_base_until_capped() {
        let expect = [10u64, 20, 40, 80, 160, 300, 300, 300];
        for (restarts, secs) in expect.iter().enumerate() {
            assert_eq!(
                restart_delay(restarts as i64),
                Duration::from_secs(*secs),
                "restarts={restarts}"
            );
        }
    }

    #[test]
    fn negative_counters_use_the_base_delay() {
        assert_eq!(restart_delay(-1), BASE_DELAY);
        assert_eq!(restart_delay(i64::MIN), BASE_DELAY);
    }

    #[test]
    fn huge_counters_stay_capped() {
        assert_eq!(restart_delay(62), MAX_DELAY);
        assert_eq!(restart_delay(i64::MAX), MAX_DELAY);
    }
}
