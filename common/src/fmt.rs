//! Human-readable size, rate and duration formatting plus the boundary
//! parsers for CLI values.

use anyhow::Context;

const UNITS: [&str; 6] = ["B", "K", "M", "G", "T", "P"];

/// Base-1024 with single-letter unit suffixes: `512B`, `1.5M`, `2.0G`.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes}B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1}{}", value, UNITS[unit])
}

pub fn format_rate(bytes_per_sec: f64) -> String {
    if !bytes_per_sec.is_finite() || bytes_per_sec < 0.0 {
        return "0B/s".to_string();
    }
    format!("{}/s", format_size(bytes_per_sec as u64))
}

/// `HhMmSs` with leading zero units omitted: `1h0m5s`, `2m3s`, `45s`.
pub fn format_duration(duration: std::time::Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Parse a human byte size (`100M`, `1.5GiB`, plain bytes).
pub fn parse_size(value: &str) -> anyhow::Result<u64> {
    let size = value
        .trim()
        .parse::<bytesize::ByteSize>()
        .map_err(|error| anyhow::anyhow!("invalid size {value:?}: {error}"))?;
    Ok(size.0)
}

/// Parse a rate limit: a human size with an optional `/s` suffix.
///
/// `-1` is the unlimited sentinel accepted at the boundary; it is normalized
/// to 0 (no limit) here so the core only ever sees 0 = unlimited.
pub fn parse_rate(value: &str) -> anyhow::Result<u64> {
    let trimmed = value.trim();
    if trimmed == "-1" {
        return Ok(0);
    }
    let without_suffix = trimmed
        .strip_suffix("/s")
        .or_else(|| trimmed.strip_suffix("/S"))
        .unwrap_or(trimmed);
    parse_size(without_suffix).context("invalid rate limit")
}

/// Accept timeout in seconds: 0 defaults to 60, anything else is clamped
/// to [1, 3600].
pub fn clamp_accept_timeout(seconds: u64) -> u64 {
    if seconds == 0 {
        60
    } else {
        seconds.clamp(1, 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(format_size(0), "0B");
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(1024), "1.0K");
        assert_eq!(format_size(1536), "1.5K");
        assert_eq!(format_size(100 * 1024 * 1024), "100.0M");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0G");
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(std::time::Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(std::time::Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(std::time::Duration::from_secs(123)), "2m3s");
        assert_eq!(
            format_duration(std::time::Duration::from_secs(3605)),
            "1h0m5s"
        );
    }

    #[test]
    fn rate_parsing() {
        assert_eq!(parse_rate("-1").unwrap(), 0);
        assert_eq!(parse_rate("1024").unwrap(), 1024);
        assert_eq!(parse_rate("10MB/s").unwrap(), 10_000_000);
        assert_eq!(parse_rate("1MiB/s").unwrap(), 1024 * 1024);
        assert!(parse_rate("fast").is_err());
    }

    #[test]
    fn timeout_clamping() {
        assert_eq!(clamp_accept_timeout(0), 60);
        assert_eq!(clamp_accept_timeout(1), 1);
        assert_eq!(clamp_accept_timeout(90), 90);
        assert_eq!(clamp_accept_timeout(7200), 3600);
    }
}
