//! AVTransport time strings.
//!
//! UPnP AVTransport reports `RelTime` / `TrackDuration` and accepts Seek
//! targets as `H:MM:SS` (hours unpadded, possibly multi-digit). Some
//! renderers append fractional seconds (`0:01:02.500`); fractions are
//! truncated on parse.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeParseError {
    #[error("invalid time format: {0}")]
    InvalidFormat(String),
    #[error("time component out of range in: {0}")]
    OutOfRange(String),
}

/// Formats seconds as `H:MM:SS` for AVTransport Seek targets.
pub fn format_hms(secs: u64) -> String {
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    format!("{}:{:02}:{:02}", h, m, s)
}

/// Parses `H:MM:SS` or `MM:SS` (with optional fractional seconds) into
/// whole seconds.
///
/// `NOT_IMPLEMENTED` is what some renderers return for RelTime while no
/// track is loaded; callers are expected to map the error to "position
/// unknown".
pub fn parse_hms(value: &str) -> Result<u64, TimeParseError> {
    let value = value.trim();
    let parts: Vec<&str> = value.split(':').collect();

    let (h, m, s) = match parts.as_slice() {
        [h, m, s] => (*h, *m, *s),
        [m, s] => ("0", *m, *s),
        _ => return Err(TimeParseError::InvalidFormat(value.to_string())),
    };

    let hours: u64 = h
        .parse()
        .map_err(|_| TimeParseError::InvalidFormat(value.to_string()))?;
    let minutes: u64 = m
        .parse()
        .map_err(|_| TimeParseError::InvalidFormat(value.to_string()))?;

    // Truncate fractional seconds
    let s_whole = s.split('.').next().unwrap_or(s);
    let seconds: u64 = s_whole
        .parse()
        .map_err(|_| TimeParseError::InvalidFormat(value.to_string()))?;

    if minutes > 59 || seconds > 59 {
        return Err(TimeParseError::OutOfRange(value.to_string()));
    }

    Ok(hours * 3600 + minutes * 60 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_zero() {
        assert_eq!(format_hms(0), "0:00:00");
    }

    #[test]
    fn format_long_durations() {
        assert_eq!(format_hms(3661), "1:01:01");
        // Audiobooks routinely exceed 10 hours
        assert_eq!(format_hms(36_000), "10:00:00");
        assert_eq!(format_hms(7199), "1:59:59");
    }

    #[test]
    fn parse_basic() {
        assert_eq!(parse_hms("0:00:00").unwrap(), 0);
        assert_eq!(parse_hms("1:01:01").unwrap(), 3661);
        assert_eq!(parse_hms("12:00:05").unwrap(), 43205);
    }

    #[test]
    fn parse_two_component() {
        assert_eq!(parse_hms("03:20").unwrap(), 200);
    }

    #[test]
    fn parse_fractional_seconds_truncated() {
        assert_eq!(parse_hms("0:01:02.500").unwrap(), 62);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_hms("NOT_IMPLEMENTED").is_err());
        assert!(parse_hms("").is_err());
        assert!(parse_hms("1:2:3:4").is_err());
    }

    #[test]
    fn parse_rejects_out_of_range() {
        assert!(parse_hms("0:61:00").is_err());
        assert!(parse_hms("0:00:75").is_err());
    }

    #[test]
    fn round_trip() {
        for secs in [0u64, 59, 60, 3599, 3600, 7200, 36_000, 86_399] {
            assert_eq!(parse_hms(&format_hms(secs)).unwrap(), secs);
        }
    }
}
