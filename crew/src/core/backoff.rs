//! Backoff arithmetic for the retry controller.

use std::time::Duration;

/// Delay to wait after failed attempt `attempt` (1-indexed): `base^attempt` units.
///
/// Saturates instead of overflowing for large bases or attempt counts.
pub fn backoff_delay(base: u32, attempt: u32, unit: Duration) -> Duration {
    let factor = u64::from(base).saturating_pow(attempt);
    let factor = u32::try_from(factor).unwrap_or(u32::MAX);
    unit.saturating_mul(factor)
}

/// Sum of the delays slept across `failed_attempts` consecutive failures.
///
/// Delays never shrink, so once one repeats (base 0 or 1, or a saturated
/// factor) the rest of the sum is a single multiplication.
pub fn total_backoff(base: u32, failed_attempts: u32, unit: Duration) -> Duration {
    let mut total = Duration::ZERO;
    let mut previous = None;
    for attempt in 1..=failed_attempts {
        let delay = backoff_delay(base, attempt, unit);
        if previous == Some(delay) {
            let remaining = failed_attempts - attempt + 1;
            return total.saturating_add(delay.saturating_mul(remaining));
        }
        total = total.saturating_add(delay);
        if total == Duration::MAX {
            return total;
        }
        previous = Some(delay);
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT: Duration = Duration::from_secs(1);

    #[test]
    fn delay_grows_as_base_to_the_attempt() {
        assert_eq!(backoff_delay(2, 1, UNIT), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, 2, UNIT), Duration::from_secs(4));
        assert_eq!(backoff_delay(3, 3, UNIT), Duration::from_secs(27));
    }

    #[test]
    fn base_one_is_constant_delay() {
        assert_eq!(backoff_delay(1, 7, UNIT), UNIT);
    }

    #[test]
    fn delay_scales_with_unit() {
        let unit = Duration::from_millis(10);
        assert_eq!(backoff_delay(2, 3, unit), Duration::from_millis(80));
    }

    #[test]
    fn delay_saturates_instead_of_overflowing() {
        let delay = backoff_delay(u32::MAX, 10, UNIT);
        assert_eq!(delay, UNIT.saturating_mul(u32::MAX));
    }

    #[test]
    fn total_matches_two_failures_at_base_two() {
        assert_eq!(total_backoff(2, 2, UNIT), Duration::from_secs(6));
        assert_eq!(total_backoff(2, 0, UNIT), Duration::ZERO);
    }

    #[test]
    fn total_for_huge_attempt_counts_is_closed_form() {
        assert_eq!(total_backoff(1, u32::MAX, UNIT), UNIT * u32::MAX);
        assert_eq!(total_backoff(0, u32::MAX, UNIT), Duration::ZERO);

        // 2^1..2^31 seconds, then the factor stays capped at u32::MAX.
        let ramp = Duration::from_secs((1u64 << 32) - 2);
        let capped = Duration::from_secs(u64::from(u32::MAX)) * (u32::MAX - 31);
        assert_eq!(total_backoff(2, u32::MAX, UNIT), ramp + capped);
    }

    #[test]
    fn total_saturates_at_max_duration() {
        let unit = Duration::from_millis(u64::MAX);
        assert_eq!(total_backoff(1000, u32::MAX, unit), Duration::MAX);
    }
}
