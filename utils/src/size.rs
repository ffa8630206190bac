//! Parsing and formatting of human-readable sizes and durations.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use byte_unit::Byte;

/// Human-readable representation of a size in bytes, using binary units.
pub fn format_size(size: u64) -> String {
    Byte::from_bytes(size as u128)
        .get_appropriate_unit(true)
        .to_string()
}

/// Size in bytes from a human-readable representation such as `10 GiB`
/// or a plain integer.
pub fn parse_size(s: &str) -> Result<u64> {
    let b = Byte::from_str(s).map_err(|e| anyhow!("Unable to parse `{s}` into a size: {e}"))?;
    u64::try_from(b.get_bytes()).with_context(|| format!("Size `{s}` out of range"))
}

/// Human-readable representation of a duration.
pub fn format_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}

/// Duration from a human-readable representation such as `7d` or `1h 30m`,
/// or a plain number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| anyhow!("Unable to parse `{s}` into a duration: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        let cases = [
            ("0", 0),
            ("1024", 1024),
            ("512 KiB", 512 * 1024),
            ("10GiB", 10 * 1024 * 1024 * 1024),
            ("2 GB", 2_000_000_000),
        ];
        for (s, v) in cases {
            assert_eq!(parse_size(s).unwrap(), v, "parsing {s}");
        }
        assert!(parse_size("ten bytes").is_err());
    }

    #[test]
    fn test_format_size() {
        let v = format_size(10 * 1024 * 1024 * 1024);
        assert!(v.starts_with("10") && v.ends_with("GiB"), "{v}");
        let v = format_size(1024);
        assert!(v.starts_with('1') && v.ends_with("KiB"), "{v}");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3600").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(
            parse_duration("7d").unwrap(),
            Duration::from_secs(7 * 24 * 3600)
        );
        assert!(parse_duration("never").is_err());
    }
}
