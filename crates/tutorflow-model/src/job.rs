//! Extraction jobs: the unit of work on the queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Queue status of an extraction job.
///
/// Lifecycle: `pending → processing → {ok|failed|skipped}`; stale-requeue
/// and operators may return a job to `pending`. `ok` is terminal unless
/// force-reprocessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Ok,
    Failed,
    Skipped,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Ok => write!(f, "ok"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl JobStatus {
    /// Terminal states never leave without an operator force.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Failed | Self::Skipped)
    }
}

/// Stable error codes written to `error_json.error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Skipped, terminal
    RawMissing,
    NonAssignment,
    // Requeue with backoff, not counted as permanent
    LlmTransient,
    CircuitOpen,
    Timeout,
    // Failed, terminal until force-reprocess
    LlmPermanent,
    LlmSchemaInvalid,
    ValidationFailed,
    EnrichmentFailed,
    UpsertConflict,
    // Logged non-fatally; the upsert stands
    DuplicateDetectionFailed,
    DeliveryFailed,
}

impl ErrorCode {
    /// The snake_case wire form, also used in log fields.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RawMissing => "raw_missing",
            Self::NonAssignment => "non_assignment",
            Self::LlmTransient => "llm_transient",
            Self::CircuitOpen => "circuit_open",
            Self::Timeout => "timeout",
            Self::LlmPermanent => "llm_permanent",
            Self::LlmSchemaInvalid => "llm_schema_invalid",
            Self::ValidationFailed => "validation_failed",
            Self::EnrichmentFailed => "enrichment_failed",
            Self::UpsertConflict => "upsert_conflict",
            Self::DuplicateDetectionFailed => "duplicate_detection_failed",
            Self::DeliveryFailed => "delivery_failed",
        }
    }

    /// Whether this code sends the job back to `pending` instead of a
    /// terminal state.
    #[must_use]
    pub fn is_requeue(&self) -> bool {
        matches!(self, Self::LlmTransient | Self::CircuitOpen | Self::Timeout)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error payload persisted on failed/skipped jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub error: ErrorCode,
    /// Pipeline stage that raised it (`load`, `extract`, `validate`, ...).
    pub stage: String,
    pub message: String,
    /// Reason codes for `validation_failed`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Per-segment error map for compilation jobs, keyed by segment index.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub segments: BTreeMap<usize, String>,
    /// Redacted raw-text sample for triage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_preview: Option<String>,
}

impl JobError {
    #[must_use]
    pub fn new(error: ErrorCode, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error,
            stage: stage.into(),
            message: message.into(),
            errors: Vec::new(),
            segments: BTreeMap::new(),
            raw_preview: None,
        }
    }

    #[must_use]
    pub fn with_reasons(mut self, reasons: Vec<String>) -> Self {
        self.errors = reasons;
        self
    }

    #[must_use]
    pub fn with_preview(mut self, preview: impl Into<String>) -> Self {
        self.raw_preview = Some(preview.into());
        self
    }
}

/// Mutable bookkeeping on a job, stored as JSON in `meta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobMeta {
    /// Claim count; incremented by every `claim`.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_reason: Option<String>,
    /// Earliest claim time after a requeue-with-backoff; `claim` skips the
    /// job until then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// Assignment rows produced by a successful run (one per segment for
    /// compilations).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignment_ids: Vec<i64>,
}

/// One unit of work: `(raw_id, pipeline_version)` unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub id: i64,
    pub raw_id: i64,
    pub pipeline_version: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub meta: JobMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Model that produced the accepted extraction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
}

/// Outcome of one `process_one` run, mapped onto a queue termination.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Extraction persisted; ids of the produced assignments.
    Ok { assignment_ids: Vec<i64> },
    /// Transient condition; return to `pending` after `backoff`.
    Retry { code: ErrorCode, backoff: Duration },
    /// Not an assignment (or raw gone); terminal skip.
    Skip { code: ErrorCode },
    /// Terminal failure with taxonomy code and reason list.
    Fail { error: Box<JobError> },
}

impl JobOutcome {
    /// Queue status this outcome terminates into.
    #[must_use]
    pub fn terminal_status(&self) -> JobStatus {
        match self {
            Self::Ok { .. } => JobStatus::Ok,
            Self::Retry { .. } => JobStatus::Pending,
            Self::Skip { .. } => JobStatus::Skipped,
            Self::Fail { .. } => JobStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(JobStatus::Ok.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Skipped.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn test_error_code_requeue_classes() {
        for code in [ErrorCode::LlmTransient, ErrorCode::CircuitOpen, ErrorCode::Timeout] {
            assert!(code.is_requeue(), "{code} should requeue");
        }
        for code in [
            ErrorCode::RawMissing,
            ErrorCode::NonAssignment,
            ErrorCode::LlmPermanent,
            ErrorCode::LlmSchemaInvalid,
            ErrorCode::ValidationFailed,
            ErrorCode::EnrichmentFailed,
            ErrorCode::UpsertConflict,
        ] {
            assert!(!code.is_requeue(), "{code} should not requeue");
        }
    }

    #[test]
    fn test_error_code_wire_form() {
        let json = serde_json::to_string(&ErrorCode::LlmSchemaInvalid).unwrap();
        assert_eq!(json, "\"llm_schema_invalid\"");
        assert_eq!(ErrorCode::CircuitOpen.as_str(), "circuit_open");
    }

    #[test]
    fn test_job_error_round_trip() {
        let err = JobError::new(ErrorCode::ValidationFailed, "validate", "2 issue(s)")
            .with_reasons(vec!["rate_inverted".into(), "bad_postal_code".into()])
            .with_preview("Sec 3 Math @ [REDACTED]");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error"], "validation_failed");
        assert_eq!(json["errors"][0], "rate_inverted");
        let back: JobError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_outcome_terminal_status() {
        assert_eq!(
            JobOutcome::Ok {
                assignment_ids: vec![1]
            }
            .terminal_status(),
            JobStatus::Ok
        );
        assert_eq!(
            JobOutcome::Retry {
                code: ErrorCode::CircuitOpen,
                backoff: Duration::from_secs(5)
            }
            .terminal_status(),
            JobStatus::Pending
        );
        assert_eq!(
            JobOutcome::Skip {
                code: ErrorCode::NonAssignment
            }
            .terminal_status(),
            JobStatus::Skipped
        );
    }
}
