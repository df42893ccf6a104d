//! Hourly-rate parsing from rate-bearing text spans
//!
//! Used when the LLM supplied no numerics. Understands the common agency
//! formats: `$40/hr`, `$40-50`, `$35 - $45 per hour`, `40/h`.

use regex::Regex;
use std::sync::LazyLock;

/// Range form first: `$40-50`, `$35 - $45/hr`, `40 to 50`.
static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$?\s*(\d{2,3})\s*(?:-|–|to)\s*\$?\s*(\d{2,3})\s*(?:/|per\s+)?\s*(?:hr|h\b|hour|hourly)?")
        .unwrap()
});

/// Single rate with an hourly marker: `$40/hr`, `40 per hour`.
static SINGLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\s*(\d{2,3})\s*(?:/|per\s+)\s*(?:hr|h\b|hour|hourly)|\b(\d{2,3})\s*(?:/|per\s+)(?:hr|h\b|hour|hourly)")
        .unwrap()
});

/// Plausible hourly-rate band; numbers outside it are postal fragments,
/// timings, or typos.
const RATE_MIN_PLAUSIBLE: i64 = 10;
const RATE_MAX_PLAUSIBLE: i64 = 500;

fn plausible(value: i64) -> bool {
    (RATE_MIN_PLAUSIBLE..=RATE_MAX_PLAUSIBLE).contains(&value)
}

/// Extract `(rate_min, rate_max)` from a text span.
///
/// Returns `None` when no plausible rate appears. A single rate yields a
/// degenerate range. Inverted ranges are normalized.
#[must_use]
pub fn parse_rate_range(text: &str) -> Option<(i64, i64)> {
    if let Some(caps) = RANGE_RE.captures(text) {
        let a: i64 = caps[1].parse().ok()?;
        let b: i64 = caps[2].parse().ok()?;
        if plausible(a) && plausible(b) {
            return Some((a.min(b), a.max(b)));
        }
    }
    if let Some(caps) = SINGLE_RE.captures(text) {
        let value: i64 = caps
            .get(1)
            .or_else(|| caps.get(2))?
            .as_str()
            .parse()
            .ok()?;
        if plausible(value) {
            return Some((value, value));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_rate_with_slash() {
        assert_eq!(parse_rate_range("$40/hr"), Some((40, 40)));
        assert_eq!(parse_rate_range("rate 45/hour"), Some((45, 45)));
    }

    #[test]
    fn test_range_forms() {
        assert_eq!(parse_rate_range("$40-50/hr"), Some((40, 50)));
        assert_eq!(parse_rate_range("$35 - $45 per hour"), Some((35, 45)));
        assert_eq!(parse_rate_range("40 to 60 hourly"), Some((40, 60)));
    }

    #[test]
    fn test_inverted_range_normalized() {
        assert_eq!(parse_rate_range("$50-40/hr"), Some((40, 50)));
    }

    #[test]
    fn test_embedded_in_post() {
        assert_eq!(
            parse_rate_range("Sec 3 Math, Tampines 520123, $40/hr, Mon 7-9pm"),
            Some((40, 40))
        );
    }

    #[test]
    fn test_no_rate() {
        assert_eq!(parse_rate_range("Sec 3 Math at Tampines"), None);
    }

    #[test]
    fn test_implausible_values_rejected() {
        // Postal fragments and times must not read as rates
        assert_eq!(parse_rate_range("block 520 unit 123"), None);
        assert_eq!(parse_rate_range("$999/hr"), None);
    }
}
