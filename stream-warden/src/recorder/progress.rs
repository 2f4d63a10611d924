//! Capture progress parsing.
//!
//! ffmpeg reports progress on stderr as lines like
//! `frame=  100 fps=25 q=-1.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1.00x`.
//! Sizes and rates come with unit strings that are normalized to bytes.

use serde::{Deserialize, Serialize};

/// Progress of one capture job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureProgress {
    /// Elapsed media time as reported (`HH:MM:SS.ms`).
    pub elapsed: String,
    /// Elapsed media time in seconds.
    pub elapsed_secs: f64,
    /// Current bitrate in bytes per second.
    pub bitrate: u64,
    /// Bytes written so far.
    pub size_bytes: u64,
    /// True when the elapsed time did not move since the previous emission.
    pub paused: bool,
}

/// Convert a size or rate string to bytes.
///
/// Decimal prefixes (`kB`, `MB`, `GB`, `TB`) scale by powers of 1000, binary
/// prefixes (`KiB`, `MiB`, ...) by powers of 1024. Bit units (`b`, `kbit`,
/// `kbits/s`, `Mb`, ...) are divided by 8. A trailing `/s` is ignored.
/// Returns `None` for anything it cannot read.
pub fn parse_size_str(input: &str) -> Option<u64> {
    let s = input.trim();
    let s = s.strip_suffix("/s").unwrap_or(s);

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().ok()?;
    let unit = unit.trim();

    let (scale, base) = split_prefix(unit);
    let divisor = match base {
        "" | "B" | "byte" | "bytes" => 1.0,
        "b" | "bit" | "bits" => 8.0,
        _ => return None,
    };

    let bytes = value * scale / divisor;
    if !bytes.is_finite() {
        return None;
    }
    Some(bytes.round() as u64)
}

/// Split a unit into its multiplier and base (`KiB` -> (1024, "B")).
fn split_prefix(unit: &str) -> (f64, &str) {
    let mut chars = unit.chars();
    let exponent = match chars.next() {
        Some('k' | 'K') => 1,
        Some('M') => 2,
        Some('G') => 3,
        Some('T') => 4,
        _ => return (1.0, unit),
    };
    let rest = &unit[1..];
    if let Some(base) = rest.strip_prefix('i') {
        (1024f64.powi(exponent), base)
    } else {
        (1000f64.powi(exponent), rest)
    }
}

/// Parse time string in `HH:MM:SS.ms` format to seconds.
pub fn parse_time(time_str: &str) -> Option<f64> {
    let parts: Vec<&str> = time_str.split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;

    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Value of a `key=value` field, tolerating padding after the `=`.
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Parse one stderr line into a progress sample.
///
/// Requires `time=` plus `size=` or `frame=` so unrelated lines are ignored.
/// Fields reported as `N/A` read as zero. The returned sample is never
/// marked paused; that is decided against the previously emitted sample.
pub fn parse_progress(line: &str) -> Option<CaptureProgress> {
    if !line.contains("time=") || !(line.contains("frame=") || line.contains("size=")) {
        return None;
    }

    let elapsed = field(line, "time=")?.to_string();
    let elapsed_secs = parse_time(&elapsed).unwrap_or(0.0);

    Some(CaptureProgress {
        elapsed_secs,
        elapsed,
        bitrate: field(line, "bitrate=").and_then(parse_size_str).unwrap_or(0),
        size_bytes: field(line, "size=").and_then(parse_size_str).unwrap_or(0),
        paused: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_str_decimal_units() {
        assert_eq!(parse_size_str("14kB"), Some(14_000));
        assert_eq!(parse_size_str("1.5GB"), Some(1_500_000_000));
        assert_eq!(parse_size_str("2MB"), Some(2_000_000));
        assert_eq!(parse_size_str("512B"), Some(512));
        assert_eq!(parse_size_str("  1024kB "), Some(1_024_000));
        assert_eq!(parse_size_str("42"), Some(42));
    }

    #[test]
    fn test_parse_size_str_binary_units() {
        assert_eq!(parse_size_str("1KiB"), Some(1024));
        assert_eq!(parse_size_str("2MiB"), Some(2 * 1024 * 1024));
    }

    #[test]
    fn test_parse_size_str_bit_units() {
        assert_eq!(parse_size_str("2000kbits/s"), Some(250_000));
        assert_eq!(parse_size_str("8Mb"), Some(1_000_000));
        assert_eq!(parse_size_str("16bit"), Some(2));
    }

    #[test]
    fn test_parse_size_str_malformed() {
        assert_eq!(parse_size_str(""), None);
        assert_eq!(parse_size_str("N/A"), None);
        assert_eq!(parse_size_str("kB"), None);
        assert_eq!(parse_size_str("1.2.3MB"), None);
        assert_eq!(parse_size_str("10 parsecs"), None);
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("00:00:10.50"), Some(10.5));
        assert_eq!(parse_time("01:30:00.00"), Some(5400.0));
        assert_eq!(parse_time("invalid"), None);
        assert_eq!(parse_time("00:00"), None);
    }

    #[test]
    fn test_parse_progress_line() {
        let line = "frame=  100 fps=25 q=-1.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1.00x";
        let progress = parse_progress(line).unwrap();
        assert_eq!(progress.elapsed, "00:00:04.00");
        assert_eq!(progress.elapsed_secs, 4.0);
        assert_eq!(progress.size_bytes, 1_024_000);
        assert_eq!(progress.bitrate, 262_150);
        assert!(!progress.paused);
    }

    #[test]
    fn test_parse_progress_not_available_fields() {
        let line = "size=N/A time=00:00:01.00 bitrate=N/A speed=N/A";
        let progress = parse_progress(line).unwrap();
        assert_eq!(progress.size_bytes, 0);
        assert_eq!(progress.bitrate, 0);
        assert_eq!(progress.elapsed_secs, 1.0);
    }

    #[test]
    fn test_parse_progress_ignores_other_lines() {
        assert!(parse_progress("Input #0, hls, from 'https://a.tv/x.m3u8':").is_none());
        assert!(parse_progress("  Duration: N/A, start: 0.000000, bitrate: N/A").is_none());
    }
}
