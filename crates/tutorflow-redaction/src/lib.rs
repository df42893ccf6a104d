//! Contact-detail redaction for triage samples
//!
//! Failure paths keep a short sample of the raw post so operators can triage
//! extraction bugs. Raw posts routinely contain parent phone numbers, so
//! every sample passes through [`redact`] before it is stored or logged.

use regex::Regex;
use std::sync::LazyLock;

/// Replacement marker for redacted spans.
pub const REDACTED: &str = "[REDACTED]";

/// Maximum triage preview length in characters.
pub const PREVIEW_MAX_CHARS: usize = 240;

/// Phone-number-shaped patterns, applied in order.
///
/// The set is deliberately aggressive: a redacted digit run that was not a
/// phone number costs nothing, a leaked number is an incident.
static PHONE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // International form with optional separators: +65 9123 4567
        Regex::new(r"\+\d{1,3}[\s-]?\d{4}[\s-]?\d{4}").unwrap(),
        // Local 8-digit runs, optionally split 4-4
        Regex::new(r"\b[3689]\d{3}[\s-]?\d{4}\b").unwrap(),
        // WhatsApp / contact annotations followed by digits
        Regex::new(r"(?i)(whatsapp|wa|call|sms|contact|hp)[\s:@.]*\+?\d[\d\s-]{6,}").unwrap(),
        // Any bare run of 7+ digits
        Regex::new(r"\d{7,}").unwrap(),
    ]
});

/// Strip phone-number-shaped digit runs from `text`.
///
/// Idempotent: redacting already-redacted text changes nothing.
#[must_use]
pub fn redact(text: &str) -> String {
    let mut out = text.to_string();
    for pattern in PHONE_PATTERNS.iter() {
        out = pattern.replace_all(&out, REDACTED).into_owned();
    }
    out
}

/// Build the redacted triage preview for a raw post: redact first, then
/// truncate on a char boundary with an ellipsis marker.
#[must_use]
pub fn raw_preview(text: &str) -> String {
    let redacted = redact(text);
    if redacted.chars().count() <= PREVIEW_MAX_CHARS {
        return redacted;
    }
    let truncated: String = redacted.chars().take(PREVIEW_MAX_CHARS).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_local_number() {
        let out = redact("Contact parent at 9123 4567 after 6pm");
        assert!(!out.contains("9123"), "got: {out}");
        assert!(out.contains(REDACTED));
    }

    #[test]
    fn test_redacts_international_number() {
        let out = redact("WhatsApp +65 8123 4567 to apply");
        assert!(!out.contains("8123"), "got: {out}");
    }

    #[test]
    fn test_redacts_bare_digit_runs() {
        let out = redact("ref 123456789 attached");
        assert!(!out.contains("123456789"));
    }

    #[test]
    fn test_preserves_postal_and_rates() {
        let out = redact("Sec 3 Math, Tampines 520123, $40/hr");
        assert!(out.contains("520123"), "postal must survive: {out}");
        assert!(out.contains("$40/hr"));
    }

    #[test]
    fn test_idempotent() {
        let once = redact("call 91234567 now");
        let twice = redact(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "课".repeat(PREVIEW_MAX_CHARS + 50);
        let preview = raw_preview(&long);
        assert_eq!(preview.chars().count(), PREVIEW_MAX_CHARS + 1);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn test_short_text_untouched() {
        assert_eq!(raw_preview("P5 English, Bishan"), "P5 English, Bishan");
    }
}
