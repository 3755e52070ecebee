//! Duration text form used on the wire
//!
//! Layout is `[d.]hh:mm:ss[.fffffffff]`. The fraction is written with
//! trailing zeros trimmed and read back with 1 to 9 digits, so 7-digit tick
//! fractions produced by other platforms decode too.

use std::time::Duration;

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * SECS_PER_MINUTE;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;

/// Maximum number of fraction digits (nanosecond precision)
const MAX_FRACTION_DIGITS: usize = 9;

/// Format a duration in the canonical text form
pub fn format(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / SECS_PER_DAY;
    let hours = (total % SECS_PER_DAY) / SECS_PER_HOUR;
    let minutes = (total % SECS_PER_HOUR) / SECS_PER_MINUTE;
    let seconds = total % SECS_PER_MINUTE;

    let mut out = if days > 0 {
        format!("{}.{:02}:{:02}:{:02}", days, hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    };

    let nanos = duration.subsec_nanos();
    if nanos > 0 {
        let fraction = format!("{:09}", nanos);
        out.push('.');
        out.push_str(fraction.trim_end_matches('0'));
    }

    out
}

/// Parse the canonical text form. Returns None for anything malformed,
/// including negative durations.
pub fn parse(input: &str) -> Option<Duration> {
    let text = input.trim();

    // The fraction separator is the first '.' after the last ':'
    let last_colon = text.rfind(':')?;
    let (clock, fraction) = match text[last_colon..].find('.') {
        Some(dot) => (&text[..last_colon + dot], Some(&text[last_colon + dot + 1..])),
        None => (text, None),
    };

    let (days, hms) = match clock.split_once('.') {
        Some((days, rest)) => (parse_number(days, usize::MAX)?, rest),
        None => (0, clock),
    };

    let mut parts = hms.split(':');
    let hours = parse_number(parts.next()?, 2)?;
    let minutes = parse_number(parts.next()?, 2)?;
    let seconds = parse_number(parts.next()?, 2)?;
    if parts.next().is_some() || hours >= 24 || minutes >= 60 || seconds >= 60 {
        return None;
    }

    let nanos = match fraction {
        Some(digits) => parse_fraction(digits)?,
        None => 0,
    };

    let total = days
        .checked_mul(SECS_PER_DAY)?
        .checked_add(hours * SECS_PER_HOUR + minutes * SECS_PER_MINUTE + seconds)?;

    Some(Duration::new(total, nanos))
}

fn parse_number(digits: &str, max_len: usize) -> Option<u64> {
    if digits.is_empty() || digits.len() > max_len || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn parse_fraction(digits: &str) -> Option<u32> {
    if digits.is_empty()
        || digits.len() > MAX_FRACTION_DIGITS
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let padded = format!("{:0<width$}", digits, width = MAX_FRACTION_DIGITS);
    padded.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        assert_eq!(format(Duration::ZERO), "00:00:00");
        assert_eq!(format(Duration::from_secs(3723)), "01:02:03");
        assert_eq!(format(Duration::from_millis(62_500)), "00:01:02.5");
        assert_eq!(format(Duration::new(2 * SECS_PER_DAY + 5, 1)), "2.00:00:05.000000001");
    }

    #[test]
    fn test_parse_tick_fraction() {
        // Seven fraction digits, as written by platforms with 100ns ticks
        assert_eq!(parse("00:01:02.5000000"), Some(Duration::from_millis(62_500)));
        assert_eq!(parse("00:00:00.0000001"), Some(Duration::from_nanos(100)));
    }

    #[test]
    fn test_parse_days_and_whitespace() {
        assert_eq!(parse(" 1.02:03:04 "), Some(Duration::from_secs(SECS_PER_DAY + 7384)));
        assert_eq!(parse("0:5:7"), Some(Duration::from_secs(307)));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for input in [
            "",
            "abc",
            "12",
            "00:00",
            "-00:00:01",
            "00:60:00",
            "24:00:00",
            "00:00:00.",
            "00:00:00.1234567890",
            "00:00:00:00",
            "1.2.00:00:00",
            "00:0x:00",
        ] {
            assert_eq!(parse(input), None, "expected {:?} to be rejected", input);
        }
    }

    #[test]
    fn test_format_parse_preserves_value() {
        for duration in [
            Duration::ZERO,
            Duration::from_nanos(1),
            Duration::from_millis(1_500),
            Duration::new(86_399, 999_999_999),
            Duration::new(400 * SECS_PER_DAY, 123_000_000),
        ] {
            assert_eq!(parse(&format(duration)), Some(duration));
        }
    }
}
