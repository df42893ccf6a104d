//! Time-availability tokenization
//!
//! The duplicate detector needs a cheap "do these two availability notes
//! talk about the same slots" check. Notes are tokenized into normalized
//! day and time tokens; overlap is set intersection, nothing smarter.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Day-name lexicon: canonical token plus lowercase needles.
static DAY_KEYWORDS: &[(&str, &[&str])] = &[
    ("mon", &["monday", "mon"]),
    ("tue", &["tuesday", "tues", "tue"]),
    ("wed", &["wednesday", "wed"]),
    ("thu", &["thursday", "thurs", "thur", "thu"]),
    ("fri", &["friday", "fri"]),
    ("sat", &["saturday", "sat"]),
    ("sun", &["sunday", "sun"]),
    ("weekday", &["weekday", "weekdays", "wkday"]),
    ("weekend", &["weekend", "weekends", "wkend"]),
];

/// Clock times like `7pm`, `7.30pm`, `19:00`.
static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,2})(?:[:.](\d{2}))?\s*(am|pm)?\b").unwrap());

/// Tokenize an availability note into normalized day/time tokens.
///
/// Times normalize to 24h hour tokens (`t19`); minutes are dropped, the
/// overlap check cares about the hour band only.
#[must_use]
pub fn availability_tokens(note: &str) -> BTreeSet<String> {
    let lower = note.to_ascii_lowercase();
    let mut tokens = BTreeSet::new();

    for (canonical, needles) in DAY_KEYWORDS {
        if needles.iter().any(|n| lower.contains(n)) {
            tokens.insert((*canonical).to_string());
        }
    }

    for caps in TIME_RE.captures_iter(&lower) {
        let Ok(hour) = caps[1].parse::<u32>() else {
            continue;
        };
        let meridiem = caps.get(3).map(|m| m.as_str());
        let hour24 = match meridiem {
            Some("pm") if hour < 12 => hour + 12,
            Some("am") if hour == 12 => 0,
            // Bare numbers without am/pm are only trusted in 24h form
            None if hour < 8 => continue,
            _ => hour,
        };
        if hour24 < 24 {
            tokens.insert(format!("t{hour24}"));
        }
    }

    tokens
}

/// Lexical overlap: both notes present and sharing at least one token.
#[must_use]
pub fn lexically_overlapping(a: &str, b: &str) -> bool {
    let ta = availability_tokens(a);
    if ta.is_empty() {
        return false;
    }
    let tb = availability_tokens(b);
    ta.intersection(&tb).next().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_and_time_tokens() {
        let tokens = availability_tokens("Mon 7-9pm");
        assert!(tokens.contains("mon"));
        assert!(tokens.contains("t21"), "tokens: {tokens:?}");
    }

    #[test]
    fn test_overlap_on_shared_day() {
        assert!(lexically_overlapping("Mon/Wed evenings", "wednesday 7pm"));
    }

    #[test]
    fn test_no_overlap() {
        assert!(!lexically_overlapping("Sat morning", "weekday 8pm"));
    }

    #[test]
    fn test_empty_note_never_overlaps() {
        assert!(!lexically_overlapping("", "Mon 7pm"));
        assert!(!lexically_overlapping("Mon 7pm", ""));
    }

    #[test]
    fn test_24h_times() {
        let tokens = availability_tokens("available 19:00 onwards");
        assert!(tokens.contains("t19"));
    }

    #[test]
    fn test_noon_and_midnight() {
        let tokens = availability_tokens("12pm or 12am");
        assert!(tokens.contains("t12"));
        assert!(tokens.contains("t0"));
    }
}
