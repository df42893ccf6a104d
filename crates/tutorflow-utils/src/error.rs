//! Workspace error taxonomy
//!
//! All subsystem error enums live here so that crates can share them without
//! depending on each other. The worker maps these onto the stable job error
//! codes persisted in `error_json` (see `tutorflow-model`).

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for library operations.
///
/// Subsystem errors convert into this via `#[from]`; the CLI is the only
/// place that formats it for humans and maps it to an exit code.
#[derive(Error, Debug)]
pub enum TutorFlowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("LLM backend error: {0}")]
    Llm(#[from] LlmError),

    #[error("Validation failed: {issue_count} issue(s)")]
    ValidationFailed {
        issues: Vec<ValidationIssue>,
        issue_count: usize,
    },

    #[error("Enrichment error: {0}")]
    Enrich(#[from] EnrichError),

    #[error("Duplicate detection error: {0}")]
    Dedup(#[from] DedupError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TutorFlowError {
    /// Exit code for CLI reporting.
    ///
    /// | Code | Error |
    /// |------|-------|
    /// | 2 | Configuration |
    /// | 3 | Store |
    /// | 4 | LLM backend |
    /// | 5 | Validation |
    /// | 1 | Everything else |
    #[must_use]
    pub fn to_exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Store(_) => 3,
            Self::Llm(_) => 4,
            Self::ValidationFailed { .. } => 5,
            _ => 1,
        }
    }
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: String },

    #[error("Failed to parse config at {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Missing required setting '{key}'")]
    Missing { key: String },
}

/// Canonical store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Row not found: {entity} {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("Upsert conflict on ({agency_id}, {external_id}): {reason}")]
    UpsertConflict {
        agency_id: String,
        external_id: String,
        reason: String,
    },

    #[error("Invalid job transition: job {job_id} is '{from}', cannot move to '{to}'")]
    InvalidTransition {
        job_id: i64,
        from: String,
        to: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),
}

/// LLM backend errors, split by retry class.
///
/// `is_transient()` decides whether the worker requeues with backoff or
/// marks the job failed.
#[derive(Error, Debug)]
pub enum LlmError {
    /// Network-level failure (connect, TLS, read). Retryable.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Upstream 5xx. Retryable.
    #[error("Upstream server error: HTTP {status}")]
    ServerError { status: u16 },

    /// Upstream 429. Retryable, with optional server-provided delay.
    #[error("Rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    /// Wall-clock timeout on the invocation. Retryable.
    #[error("LLM invocation timed out after {}s", timeout.as_secs())]
    Timeout { timeout: Duration },

    /// The circuit breaker is open for this model; no call was attempted.
    #[error("Circuit open for model '{model}'")]
    CircuitOpen { model: String },

    /// Upstream 4xx other than 429. Terminal.
    #[error("Upstream rejected request: HTTP {status}: {message}")]
    ClientError { status: u16, message: String },

    /// The response did not parse into the canonical schema. Terminal.
    #[error("Response violates extraction schema: {0}")]
    SchemaInvalid(String),

    /// Local setup problem (missing key, bad URL). Terminal.
    #[error("Backend misconfigured: {0}")]
    Misconfiguration(String),
}

impl LlmError {
    /// Whether a retry (or requeue with backoff) is warranted.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::ServerError { .. }
                | Self::RateLimited { .. }
                | Self::Timeout { .. }
        )
    }
}

/// A single validation failure on an extracted payload.
///
/// `code()` is the stable reason code persisted in `error_json.errors[]`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    #[error("Missing required field '{field}'")]
    MissingField { field: &'static str },

    #[error("rate_min {min} exceeds rate_max {max}")]
    RateInverted { min: i64, max: i64 },

    #[error("Postal code '{value}' is not six digits")]
    BadPostalCode { value: String },

    #[error("Array '{field}' has {len} entries, limit {limit}")]
    ArrayOverflow {
        field: &'static str,
        len: usize,
        limit: usize,
    },

    #[error("Field '{field}' value '{value}' outside enum domain")]
    BadEnumValue { field: &'static str, value: String },

    #[error("Field '{field}' is {len} chars, limit {limit}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        limit: usize,
    },
}

impl ValidationIssue {
    /// Stable reason code for `error_json.errors[]`.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingField { .. } => "missing_field",
            Self::RateInverted { .. } => "rate_inverted",
            Self::BadPostalCode { .. } => "bad_postal_code",
            Self::ArrayOverflow { .. } => "array_overflow",
            Self::BadEnumValue { .. } => "bad_enum_value",
            Self::FieldTooLong { .. } => "field_too_long",
        }
    }
}

/// Deterministic enrichment errors.
///
/// Enrichers are pure and rarely fail; this exists for the terminal
/// `enrichment_failed` taxonomy entry when a lookup table rejects input the
/// validators passed.
#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("Postal lookup rejected '{postal}': {reason}")]
    PostalLookup { postal: String, reason: String },

    #[error("Canonicalization table missing level '{level}'")]
    UnknownLevel { level: String },
}

/// Duplicate detection errors (never block the upsert)
#[derive(Error, Debug)]
pub enum DedupError {
    #[error("Candidate query failed: {0}")]
    CandidateQuery(String),

    #[error("Group transition failed for group {group_id}: {reason}")]
    GroupTransition { group_id: i64, reason: String },
}

/// Delivery fanout errors (never block the upsert)
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Transport send failed: {0}")]
    Transport(String),

    #[error("Broadcast edit failed for '{external_id}': {reason}")]
    BroadcastEdit { external_id: String, reason: String },

    #[error("Delivery throttled: {0}")]
    Throttled(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_transient_classification() {
        assert!(LlmError::Transport("reset".into()).is_transient());
        assert!(LlmError::ServerError { status: 503 }.is_transient());
        assert!(
            LlmError::RateLimited {
                retry_after: None
            }
            .is_transient()
        );
        assert!(
            LlmError::Timeout {
                timeout: Duration::from_secs(30)
            }
            .is_transient()
        );

        assert!(
            !LlmError::ClientError {
                status: 400,
                message: "bad request".into()
            }
            .is_transient()
        );
        assert!(!LlmError::SchemaInvalid("no json".into()).is_transient());
        assert!(!LlmError::Misconfiguration("no key".into()).is_transient());
        // CircuitOpen is handled by the worker requeue path, not the retry loop
        assert!(
            !LlmError::CircuitOpen {
                model: "m".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_validation_issue_codes_are_stable() {
        let issues = vec![
            ValidationIssue::MissingField { field: "external_id" },
            ValidationIssue::RateInverted { min: 80, max: 40 },
            ValidationIssue::BadPostalCode {
                value: "12345".into(),
            },
        ];
        let codes: Vec<&str> = issues.iter().map(ValidationIssue::code).collect();
        assert_eq!(codes, vec!["missing_field", "rate_inverted", "bad_postal_code"]);
    }

    #[test]
    fn test_exit_code_mapping() {
        let err = TutorFlowError::Config(ConfigError::Missing {
            key: "pipeline_version".into(),
        });
        assert_eq!(err.to_exit_code(), 2);

        let err = TutorFlowError::Store(StoreError::Database("down".into()));
        assert_eq!(err.to_exit_code(), 3);
    }
}
