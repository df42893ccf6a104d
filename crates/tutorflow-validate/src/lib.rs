//! Validation of extracted payloads
//!
//! Runs after extraction and before enrichment. Collects every violation
//! rather than stopping at the first, so `error_json.errors[]` gives the
//! operator the full picture in one pass.

use regex::Regex;
use std::sync::LazyLock;

use tutorflow_model::ExtractedPayload;
use tutorflow_utils::error::ValidationIssue;

static POSTAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{6}$").unwrap());

/// Bounds on array fields; anything past these is extraction garbage.
const MAX_SUBJECTS: usize = 20;
const MAX_LEVELS: usize = 10;
const MAX_ADDRESSES: usize = 10;
const MAX_POSTALS: usize = 10;
const MAX_SCHEDULE: usize = 20;
const MAX_TUTOR_TYPES: usize = 10;

/// Longest acceptable display text.
const MAX_DISPLAY_TEXT: usize = 2_000;

/// Accepted learning modes, the only enum-domain field the LLM fills.
const LEARNING_MODES: &[&str] = &["online", "in_person", "hybrid"];

/// Validate one extracted payload.
///
/// # Errors
///
/// Returns the full list of violations; the job fails with
/// `validation_failed` and the issue codes in `errors[]`.
pub fn validate(payload: &ExtractedPayload) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();

    // A payload with neither display text nor a single subject cannot
    // render as an assignment at all.
    if payload
        .academic_display_text
        .as_deref()
        .is_none_or(|t| t.trim().is_empty())
        && payload.subjects.is_empty()
    {
        issues.push(ValidationIssue::MissingField {
            field: "academic_display_text",
        });
    }

    if let (Some(min), Some(max)) = (payload.rate_min, payload.rate_max)
        && min > max
    {
        issues.push(ValidationIssue::RateInverted { min, max });
    }

    for code in payload
        .postal_code
        .iter()
        .chain(payload.postal_code_estimated.iter())
    {
        if !POSTAL_RE.is_match(code) {
            issues.push(ValidationIssue::BadPostalCode { value: code.clone() });
        }
    }

    check_len(&mut issues, "subjects", payload.subjects.len(), MAX_SUBJECTS);
    check_len(&mut issues, "levels", payload.levels.len(), MAX_LEVELS);
    check_len(&mut issues, "address", payload.address.len(), MAX_ADDRESSES);
    check_len(&mut issues, "postal_code", payload.postal_code.len(), MAX_POSTALS);
    check_len(
        &mut issues,
        "postal_code_estimated",
        payload.postal_code_estimated.len(),
        MAX_POSTALS,
    );
    check_len(
        &mut issues,
        "lesson_schedule",
        payload.lesson_schedule.len(),
        MAX_SCHEDULE,
    );
    check_len(
        &mut issues,
        "tutor_types",
        payload.tutor_types.len(),
        MAX_TUTOR_TYPES,
    );

    if let Some(mode) = payload.learning_mode.as_deref()
        && !LEARNING_MODES.contains(&mode)
    {
        issues.push(ValidationIssue::BadEnumValue {
            field: "learning_mode",
            value: mode.to_string(),
        });
    }

    if let Some(text) = payload.academic_display_text.as_deref()
        && text.chars().count() > MAX_DISPLAY_TEXT
    {
        issues.push(ValidationIssue::FieldTooLong {
            field: "academic_display_text",
            len: text.chars().count(),
            limit: MAX_DISPLAY_TEXT,
        });
    }

    if issues.is_empty() { Ok(()) } else { Err(issues) }
}

fn check_len(
    issues: &mut Vec<ValidationIssue>,
    field: &'static str,
    len: usize,
    limit: usize,
) {
    if len > limit {
        issues.push(ValidationIssue::ArrayOverflow { field, len, limit });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_payload() -> ExtractedPayload {
        ExtractedPayload {
            academic_display_text: Some("Sec 3 E Math".into()),
            subjects: vec!["Math".into()],
            postal_code: vec!["520123".into()],
            rate_min: Some(40),
            rate_max: Some(50),
            ..ExtractedPayload::default()
        }
    }

    #[test]
    fn test_valid_payload_passes() {
        assert!(validate(&valid_payload()).is_ok());
    }

    #[test]
    fn test_inverted_rate_rejected() {
        let mut p = valid_payload();
        p.rate_min = Some(80);
        p.rate_max = Some(40);
        let issues = validate(&p).unwrap_err();
        assert!(issues.iter().any(|i| i.code() == "rate_inverted"));
    }

    #[test]
    fn test_bad_postal_rejected() {
        let mut p = valid_payload();
        p.postal_code.push("12345".into());
        p.postal_code_estimated.push("abc123".into());
        let issues = validate(&p).unwrap_err();
        assert_eq!(
            issues.iter().filter(|i| i.code() == "bad_postal_code").count(),
            2
        );
    }

    #[test]
    fn test_empty_payload_missing_display() {
        let issues = validate(&ExtractedPayload::default()).unwrap_err();
        assert!(issues.iter().any(|i| i.code() == "missing_field"));
    }

    #[test]
    fn test_subjects_alone_satisfy_display_rule() {
        let p = ExtractedPayload {
            subjects: vec!["Math".into()],
            ..ExtractedPayload::default()
        };
        assert!(validate(&p).is_ok());
    }

    #[test]
    fn test_array_bound_enforced() {
        let mut p = valid_payload();
        p.subjects = (0..25).map(|i| format!("s{i}")).collect();
        let issues = validate(&p).unwrap_err();
        assert!(issues.iter().any(|i| i.code() == "array_overflow"));
    }

    #[test]
    fn test_unknown_learning_mode_rejected() {
        let mut p = valid_payload();
        p.learning_mode = Some("telepathy".into());
        let issues = validate(&p).unwrap_err();
        assert!(issues.iter().any(|i| i.code() == "bad_enum_value"));
    }

    #[test]
    fn test_all_issues_collected() {
        let p = ExtractedPayload {
            rate_min: Some(90),
            rate_max: Some(40),
            postal_code: vec!["12".into()],
            ..ExtractedPayload::default()
        };
        let issues = validate(&p).unwrap_err();
        // missing display, inverted rate, bad postal — all in one pass
        assert_eq!(issues.len(), 3);
    }
}
