use chrono::Utc;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Absolute distance between two millisecond timestamps.
pub fn skew_millis(a: u64, b: u64) -> u64 {
    a.abs_diff(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_skew_is_symmetric() {
        assert_eq!(skew_millis(10, 4), 6);
        assert_eq!(skew_millis(4, 10), 6);
    }
}
