// ABOUTME: Utilities for working with times and timestamps.
// ABOUTME: Provides RFC3339 formatting for health reports and logs.
use ::time::{format_description::well_known::Rfc3339, OffsetDateTime};
use std::time::SystemTime;

/// Get the current system time
///
/// # Examples
///
/// ```
/// use gl_core::utc_now;
/// let now = utc_now();
/// assert!(now.duration_since(std::time::UNIX_EPOCH).is_ok());
/// ```
pub fn utc_now() -> SystemTime {
    SystemTime::now()
}

/// Convert a SystemTime to an RFC3339 timestamp string
///
/// # Examples
///
/// ```
/// use gl_core::to_rfc3339;
/// use std::time::{Duration, UNIX_EPOCH};
///
/// let time = UNIX_EPOCH + Duration::from_secs(1_609_459_200); // 2021-01-01
/// let timestamp = to_rfc3339(time);
/// assert_eq!(timestamp, "2021-01-01T00:00:00Z");
/// ```
pub fn to_rfc3339(time: SystemTime) -> String {
    OffsetDateTime::from(time)
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Get current time as an RFC3339 formatted string
pub fn now_iso8601() -> String {
    to_rfc3339(utc_now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_utc_now() {
        let now = utc_now();
        let duration_since_epoch = now.duration_since(UNIX_EPOCH).unwrap();
        // Should be a reasonable time (after 2020)
        assert!(duration_since_epoch.as_secs() > 1_577_836_800); // 2020-01-01
    }

    #[test]
    fn test_to_rfc3339() {
        let time = UNIX_EPOCH + Duration::from_secs(1_609_459_200); // 2021-01-01
        let timestamp = to_rfc3339(time);
        assert_eq!(timestamp, "2021-01-01T00:00:00Z");
    }

    #[test]
    fn test_now_iso8601_not_empty() {
        assert!(!now_iso8601().is_empty());
    }
}
