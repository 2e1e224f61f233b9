//! Utility functions for uplink-core.

use time::OffsetDateTime;

use uplink_types::EpochMillis;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> EpochMillis {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
}

/// Milliseconds in `days` days.
pub fn days_to_millis(days: u32) -> i64 {
    i64::from(days) * 24 * 60 * 60 * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_after_2024() {
        assert!(now_millis() > 1_704_067_200_000);
    }

    #[test]
    fn test_days_to_millis() {
        assert_eq!(days_to_millis(0), 0);
        assert_eq!(days_to_millis(7), 604_800_000);
    }
}
