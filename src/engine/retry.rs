//! Exponential backoff computation for step retries.

/// Delay before retrying attempt `attempt` (1-based):
/// `min(base_ms * 2^(attempt-1), cap_ms)`.
///
/// Attempt 0 (or a zero base) yields no delay. The shift saturates so large
/// attempt numbers land on the cap instead of overflowing.
pub fn backoff_delay_ms(base_ms: u64, cap_ms: u64, attempt: u32) -> u64 {
    if attempt == 0 || base_ms == 0 {
        return 0;
    }
    let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(cap_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay_ms(1000, 300_000, 1), 1000);
        assert_eq!(backoff_delay_ms(1000, 300_000, 2), 2000);
        assert_eq!(backoff_delay_ms(1000, 300_000, 3), 4000);
        assert_eq!(backoff_delay_ms(1000, 300_000, 4), 8000);
    }

    #[test]
    fn backoff_caps_at_maximum() {
        assert_eq!(backoff_delay_ms(1000, 5000, 4), 5000);
        assert_eq!(backoff_delay_ms(1000, 5000, 10), 5000);
    }

    #[test]
    fn backoff_handles_degenerate_inputs() {
        assert_eq!(backoff_delay_ms(1000, 5000, 0), 0);
        assert_eq!(backoff_delay_ms(0, 5000, 3), 0);
    }

    #[test]
    fn backoff_survives_large_attempt_numbers() {
        // 2^63 and beyond must saturate onto the cap, not overflow
        assert_eq!(backoff_delay_ms(1000, 300_000, 64), 300_000);
        assert_eq!(backoff_delay_ms(1000, 300_000, 200), 300_000);
    }
}
