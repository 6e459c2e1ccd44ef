//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Delay before retrying after failed attempt `attempt` (1-based).
///
/// `min(base * exponential_base^(attempt-1), max)`, then scaled by a random
/// factor in `[0.5, 1.0]` when `jitter` is set.
pub fn calculate_backoff(
    attempt: u32,
    base: Duration,
    max: Duration,
    exponential_base: f64,
    jitter: bool,
) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
    let scaled = base.as_secs_f64() * exponential_base.powi(exponent);
    let capped = if scaled.is_finite() {
        scaled.min(max.as_secs_f64())
    } else {
        max.as_secs_f64()
    };

    let factor = if jitter {
        rand::thread_rng().gen_range(0.5..=1.0)
    } else {
        1.0
    };

    Duration::from_secs_f64((capped * factor).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(10);

        assert_eq!(calculate_backoff(1, base, max, 2.0, false), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, base, max, 2.0, false), Duration::from_secs(2));
        assert_eq!(calculate_backoff(3, base, max, 2.0, false), Duration::from_secs(4));
        assert_eq!(calculate_backoff(10, base, max, 2.0, false), max);
        assert_eq!(calculate_backoff(0, base, max, 2.0, false), Duration::ZERO);
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(800);
        for _ in 0..100 {
            let delay = calculate_backoff(1, base, Duration::from_secs(60), 2.0, true);
            assert!(delay >= Duration::from_millis(399) && delay <= base, "{:?}", delay);
        }
    }

    #[test]
    fn test_huge_attempt_is_capped() {
        let delay = calculate_backoff(u32::MAX, Duration::from_secs(1), Duration::from_secs(60), 2.0, false);
        assert_eq!(delay, Duration::from_secs(60));
    }
}
