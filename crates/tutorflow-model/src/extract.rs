//! The LLM boundary: schema-described JSON in, typed payload out
//!
//! The extractor deserializes the model's JSON into [`ExtractedPayload`] at
//! the boundary and everything downstream works with the typed form. The
//! raw JSON is kept only on the job row for debugging.

use serde::{Deserialize, Serialize};

use crate::assignment::TutorType;

/// Per-agency prompt hints: code prefixes, known formatting quirks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgencyHints {
    pub agency_id: String,
    /// Common assignment-code prefixes, e.g. `["TA-", "#"]`.
    #[serde(default)]
    pub code_prefixes: Vec<String>,
    /// Free-text guidance appended to the extraction prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_note: Option<String>,
}

/// Canonical extraction payload, as the schema the LLM is asked to fill.
///
/// Every field is optional or defaulted: validation decides what is
/// acceptable, not deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedPayload {
    /// Stable id within the agency; falls back to the assignment code or
    /// the raw message id when the post has no explicit id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub academic_display_text: Option<String>,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub levels: Vec<String>,
    #[serde(default)]
    pub lesson_schedule: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_availability_note: Option<String>,
    #[serde(default)]
    pub tutor_types: Vec<TutorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_mode: Option<String>,

    #[serde(default)]
    pub address: Vec<String>,
    #[serde(default)]
    pub postal_code: Vec<String>,
    /// Postal codes the model inferred rather than read verbatim.
    #[serde(default)]
    pub postal_code_estimated: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_raw_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_breakdown: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_max: Option<i64>,
}

impl ExtractedPayload {
    /// Resolve the identity this payload upserts under.
    ///
    /// Preference order: explicit `external_id`, then `assignment_code`,
    /// then the caller-supplied fallback (the raw message id). Segment
    /// suffixes for compilations are applied by the worker, not here.
    #[must_use]
    pub fn resolve_external_id(&self, fallback: &str) -> String {
        self.external_id
            .as_deref()
            .or(self.assignment_code.as_deref())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(fallback)
            .trim()
            .to_string()
    }
}

/// Result of asking the LLM to confirm and split a compilation post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationSplit {
    /// Whether the model confirmed the post contains multiple independent
    /// assignments.
    pub is_compilation: bool,
    /// Independent segments in original order. Indices are positional and
    /// stable across reprocessings of the same raw version.
    #[serde(default)]
    pub segments: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_tolerates_sparse_json() {
        let payload: ExtractedPayload =
            serde_json::from_str(r#"{"subjects": ["Math"]}"#).unwrap();
        assert_eq!(payload.subjects, vec!["Math"]);
        assert!(payload.external_id.is_none());
        assert!(payload.postal_code.is_empty());
    }

    #[test]
    fn test_resolve_external_id_preference_order() {
        let mut p = ExtractedPayload::default();
        assert_eq!(p.resolve_external_id("raw-100"), "raw-100");

        p.assignment_code = Some("TA-55".into());
        assert_eq!(p.resolve_external_id("raw-100"), "TA-55");

        p.external_id = Some(" a-9 ".into());
        assert_eq!(p.resolve_external_id("raw-100"), "a-9");

        // Blank explicit ids fall through
        p.external_id = Some("  ".into());
        assert_eq!(p.resolve_external_id("raw-100"), "TA-55");
    }
}
