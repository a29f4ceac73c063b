//! Timestamp helpers. Timestamps are stored as `INTEGER` epoch milliseconds (UTC).

use chrono::{DateTime, TimeZone, Utc};

#[inline]
pub fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Out-of-range values clamp to the epoch instead of panicking.
#[inline]
pub fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[inline]
pub fn opt_from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_conversion_preserves_millis() {
        let dt = from_ms(1_700_000_000_123);
        assert_eq!(to_ms(dt), 1_700_000_000_123);
        assert_eq!(from_ms(i64::MAX), DateTime::<Utc>::UNIX_EPOCH);
    }
}
