//! The per-job pipeline

use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use tutorflow_enrich::{Enrichment, enrich};
use tutorflow_llm::LlmError;
use tutorflow_model::{
    AgencyHints, AssignmentDraft, ErrorCode, ExtractedPayload, ExtractionJob, JobError,
    JobOutcome, RawMessage,
};
use tutorflow_redaction::raw_preview;
use tutorflow_store::Store;
use tutorflow_utils::metrics::StageTimer;

use crate::WorkerContext;

/// Backoff floor for requeued jobs, doubled per attempt.
const RETRY_BASE: Duration = Duration::from_secs(30);
const RETRY_CAP: Duration = Duration::from_secs(900);

/// Spam markers that disqualify a post outright.
const SPAM_MARKERS: &[&str] = &[
    "join our channel",
    "advertise with us",
    "promo code",
    "referral bonus",
];

/// Minimum text length that can plausibly describe an assignment.
const MIN_POST_CHARS: usize = 12;

fn backoff_for_attempt(attempt: u32) -> Duration {
    RETRY_BASE
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(RETRY_CAP)
}

/// Plainly-not-an-assignment pre-filter, deterministic and cheap.
fn is_non_assignment(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.chars().count() < MIN_POST_CHARS {
        return true;
    }
    if !trimmed.chars().any(|c| c.is_alphabetic()) {
        return true;
    }
    let lower = trimmed.to_ascii_lowercase();
    SPAM_MARKERS.iter().any(|m| lower.contains(m))
}

/// Run one claimed job through the pipeline. Never panics; every path
/// resolves to a [`JobOutcome`] for the caller to terminate with.
pub async fn process_one(ctx: &WorkerContext, job: &ExtractionJob) -> JobOutcome {
    // 1. Load
    let timer = StageTimer::start(&ctx.metrics, "load", Some(job.id));
    let raw = match ctx.store.get_raw(job.raw_id).await {
        Ok(Some(raw)) if raw.deleted_at.is_none() => {
            timer.finish("ok");
            raw
        }
        Ok(_) => {
            timer.finish("skip");
            return JobOutcome::Skip {
                code: ErrorCode::RawMissing,
            };
        }
        Err(e) => {
            timer.finish("retry");
            warn!(job_id = job.id, error = %e, "raw load failed, requeueing");
            return JobOutcome::Retry {
                code: ErrorCode::Timeout,
                backoff: backoff_for_attempt(job.meta.attempt),
            };
        }
    };

    // 2. Pre-filter
    if is_non_assignment(&raw.text) {
        ctx.metrics.incr("prefilter.skip");
        return JobOutcome::Skip {
            code: ErrorCode::NonAssignment,
        };
    }

    let hints = agency_hints(ctx, &raw);

    // 3. Compilation check: heuristics flag, the LLM confirms and splits.
    if ctx.heuristic.looks_like_compilation(&raw.text) {
        let timer = StageTimer::start(&ctx.metrics, "compilation_check", Some(job.id));
        match ctx.extractor.confirm_and_split(&raw.text).await {
            Ok(split) if split.is_compilation => {
                timer.finish("confirmed");
                return process_compilation(ctx, job, &raw, &hints, &split.segments).await;
            }
            Ok(_) => {
                timer.finish("rejected");
                debug!(job_id = job.id, "heuristic flagged compilation, LLM rejected");
            }
            Err(err) => {
                timer.finish("error");
                return llm_error_outcome(job, &raw, "compilation_check", err);
            }
        }
    }

    // 4-9. Single-assignment path
    match process_segment(ctx, job, &raw, &hints, &raw.text, None).await {
        SegmentResult::Done(assignment_id) => JobOutcome::Ok {
            assignment_ids: vec![assignment_id],
        },
        SegmentResult::Abort(outcome) => outcome,
    }
}

/// Per-segment processing for compilations. Segment order is preserved
/// and indices are positional, which keeps them stable across
/// reprocessings of the same raw version.
async fn process_compilation(
    ctx: &WorkerContext,
    job: &ExtractionJob,
    raw: &RawMessage,
    hints: &AgencyHints,
    segments: &[String],
) -> JobOutcome {
    let mut assignment_ids = Vec::with_capacity(segments.len());
    let mut segment_errors: BTreeMap<usize, String> = BTreeMap::new();

    for (idx, segment) in segments.iter().enumerate() {
        match process_segment(ctx, job, raw, hints, segment, Some(idx)).await {
            SegmentResult::Done(id) => assignment_ids.push(id),
            SegmentResult::Abort(JobOutcome::Retry { code, backoff }) => {
                // A transient failure on any segment requeues the whole
                // job; completed segments were upserted idempotently and
                // will merge cleanly on the retry.
                return JobOutcome::Retry { code, backoff };
            }
            SegmentResult::Abort(JobOutcome::Skip { code }) => {
                segment_errors.insert(idx, code.as_str().to_string());
            }
            SegmentResult::Abort(JobOutcome::Fail { error }) => {
                let summary = if error.errors.is_empty() {
                    error.error.as_str().to_string()
                } else {
                    format!("{}: {}", error.error.as_str(), error.errors.join(","))
                };
                segment_errors.insert(idx, summary);
            }
            SegmentResult::Abort(JobOutcome::Ok { .. }) => unreachable!("segments never abort ok"),
        }
    }

    if segment_errors.is_empty() {
        JobOutcome::Ok { assignment_ids }
    } else {
        let mut error = JobError::new(
            ErrorCode::ValidationFailed,
            "compilation",
            format!(
                "{}/{} segments failed",
                segment_errors.len(),
                segments.len()
            ),
        )
        .with_preview(raw_preview(&raw.text));
        error.segments = segment_errors;
        JobOutcome::Fail {
            error: Box::new(error),
        }
    }
}

enum SegmentResult {
    Done(i64),
    Abort(JobOutcome),
}

/// Extract → validate → enrich → upsert → side-effects for one text unit
/// (the whole post, or one compilation segment).
async fn process_segment(
    ctx: &WorkerContext,
    job: &ExtractionJob,
    raw: &RawMessage,
    hints: &AgencyHints,
    text: &str,
    segment_idx: Option<usize>,
) -> SegmentResult {
    // 4. Extract
    let timer = StageTimer::start(&ctx.metrics, "extract", Some(job.id));
    let (payload, _model) = match ctx.extractor.extract(text, hints).await {
        Ok(out) => {
            timer.finish("ok");
            out
        }
        Err(err) => {
            timer.finish("error");
            return SegmentResult::Abort(llm_error_outcome(job, raw, "extract", err));
        }
    };

    // 5. Validate
    let timer = StageTimer::start(&ctx.metrics, "validate", Some(job.id));
    if let Err(issues) = tutorflow_validate::validate(&payload) {
        timer.finish("failed");
        let reasons: Vec<String> = issues.iter().map(|i| i.code().to_string()).collect();
        let messages: Vec<String> = issues.iter().map(ToString::to_string).collect();
        let error = JobError::new(
            ErrorCode::ValidationFailed,
            "validate",
            messages.join("; "),
        )
        .with_reasons(reasons)
        .with_preview(raw_preview(text));
        return SegmentResult::Abort(JobOutcome::Fail {
            error: Box::new(error),
        });
    }
    timer.finish("ok");

    // 6. Enrich
    let timer = StageTimer::start(&ctx.metrics, "enrich", Some(job.id));
    let enrichment = enrich(&payload, text);
    timer.finish("ok");

    // 7. Upsert
    let draft = build_draft(raw, &payload, &enrichment, segment_idx);
    let timer = StageTimer::start(&ctx.metrics, "upsert", Some(job.id));
    let assignment = match ctx.store.upsert_assignment(draft).await {
        Ok(assignment) => {
            timer.finish("ok");
            assignment
        }
        Err(e) => {
            timer.finish("failed");
            let error = JobError::new(ErrorCode::UpsertConflict, "upsert", e.to_string())
                .with_preview(raw_preview(text));
            return SegmentResult::Abort(JobOutcome::Fail {
                error: Box::new(error),
            });
        }
    };

    // 8. Duplicate pass: failures log and proceed, the upsert stands.
    let timer = StageTimer::start(&ctx.metrics, "dedup", Some(job.id));
    let assignment = match ctx.detector.process(&assignment).await {
        Ok(_) => {
            timer.finish("ok");
            // Reload: the pass may have changed group linkage and primary.
            ctx.store
                .get_assignment(assignment.id)
                .await
                .ok()
                .flatten()
                .unwrap_or(assignment)
        }
        Err(e) => {
            timer.finish("failed");
            ctx.metrics.incr("dedup.nonfatal_error");
            warn!(
                job_id = job.id,
                assignment_id = assignment.id,
                error = %e,
                code = ErrorCode::DuplicateDetectionFailed.as_str(),
                "duplicate detection failed, assignment stays unlinked"
            );
            assignment
        }
    };

    // 9. Delivery side-effects: same non-blocking contract.
    let timer = StageTimer::start(&ctx.metrics, "delivery", Some(job.id));
    match ctx.delivery.fanout(&assignment).await {
        Ok(_) => timer.finish("ok"),
        Err(e) => {
            timer.finish("failed");
            ctx.metrics.incr("delivery.nonfatal_error");
            warn!(
                job_id = job.id,
                assignment_id = assignment.id,
                error = %e,
                code = ErrorCode::DeliveryFailed.as_str(),
                "delivery fanout failed"
            );
        }
    }

    SegmentResult::Done(assignment.id)
}

/// Map an extractor error onto the job outcome taxonomy.
fn llm_error_outcome(
    job: &ExtractionJob,
    raw: &RawMessage,
    stage: &str,
    err: LlmError,
) -> JobOutcome {
    let backoff = backoff_for_attempt(job.meta.attempt);
    match err {
        LlmError::CircuitOpen { .. } => JobOutcome::Retry {
            code: ErrorCode::CircuitOpen,
            backoff,
        },
        LlmError::Timeout { .. } => JobOutcome::Retry {
            code: ErrorCode::Timeout,
            backoff,
        },
        ref e if e.is_transient() => JobOutcome::Retry {
            code: ErrorCode::LlmTransient,
            backoff,
        },
        LlmError::SchemaInvalid(message) => JobOutcome::Fail {
            error: Box::new(
                JobError::new(ErrorCode::LlmSchemaInvalid, stage, message)
                    .with_preview(raw_preview(&raw.text)),
            ),
        },
        other => JobOutcome::Fail {
            error: Box::new(
                JobError::new(ErrorCode::LlmPermanent, stage, other.to_string())
                    .with_preview(raw_preview(&raw.text)),
            ),
        },
    }
}

fn agency_hints(ctx: &WorkerContext, raw: &RawMessage) -> AgencyHints {
    let section = ctx.config.agencies.get(&raw.agency_id);
    AgencyHints {
        agency_id: raw.agency_id.clone(),
        code_prefixes: section.map(|s| s.code_prefixes.clone()).unwrap_or_default(),
        prompt_note: section.and_then(|s| s.prompt_note.clone()),
    }
}

/// Assemble the upsert row from the extraction, the enrichment, and the
/// raw provenance. Segment indices suffix the fallback identity so the
/// members of a compilation stay distinct and stable.
fn build_draft(
    raw: &RawMessage,
    payload: &ExtractedPayload,
    enrichment: &Enrichment,
    segment_idx: Option<usize>,
) -> AssignmentDraft {
    let fallback = match segment_idx {
        Some(idx) => format!("{}#{idx}", raw.message_id),
        None => raw.message_id.clone(),
    };
    let mut external_id = payload.resolve_external_id(&fallback);
    // Segments that resolve to the same agency code would collide; pin the
    // index onto all but the first.
    if let Some(idx) = segment_idx
        && idx > 0
        && external_id != fallback
        && payload.external_id.is_none()
    {
        external_id = format!("{external_id}#{idx}");
    }

    let geo = enrichment.geo.as_ref();
    AssignmentDraft {
        agency_id: raw.agency_id.clone(),
        external_id,
        assignment_code: payload.assignment_code.clone(),
        message_link: Some(raw.message_link()),
        academic_display_text: payload.academic_display_text.clone(),
        lesson_schedule: payload.lesson_schedule.clone(),
        start_date: payload.start_date.clone(),
        time_availability_note: payload.time_availability_note.clone(),
        tutor_types: payload.tutor_types.clone(),
        rate_raw_text: payload.rate_raw_text.clone(),
        rate_breakdown: payload.rate_breakdown.clone(),
        learning_mode: payload.learning_mode.clone(),
        address: payload.address.clone(),
        postal_code: payload.postal_code.clone(),
        postal_code_estimated: payload.postal_code_estimated.clone(),
        postal_lat: geo.map(|g| g.lat),
        postal_lon: geo.map(|g| g.lon),
        postal_coords_estimated: enrichment.coords_estimated,
        region: geo.map(|g| g.region),
        nearest_mrt_computed: geo.map(|g| g.nearest_mrt.clone()),
        nearest_mrt_computed_line: geo.map(|g| g.nearest_mrt_line.clone()),
        nearest_mrt_computed_distance_m: geo.map(|g| g.nearest_mrt_distance_m),
        rate_min: enrichment.rate_min,
        rate_max: enrichment.rate_max,
        signals_subjects: enrichment.signals.subjects.clone(),
        signals_levels: enrichment.signals.levels.clone(),
        signals_specific_student_levels: enrichment.signals.specific_student_levels.clone(),
        subjects_canonical: enrichment.canonical.canonical.clone(),
        subjects_general: enrichment.canonical.general.clone(),
        canonicalization_version: enrichment.canonicalization_version,
        published_at: Some(raw.published_at),
        source_last_seen: Some(raw.source_last_seen()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefilter_rules() {
        assert!(is_non_assignment(""));
        assert!(is_non_assignment("   "));
        assert!(is_non_assignment("ok"));
        assert!(is_non_assignment("123 456 789 000"));
        assert!(is_non_assignment("Join our channel for more deals!"));
        assert!(!is_non_assignment("Sec 3 Math, Tampines 520123, $40/hr"));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_for_attempt(1), Duration::from_secs(30));
        assert_eq!(backoff_for_attempt(2), Duration::from_secs(60));
        assert_eq!(backoff_for_attempt(3), Duration::from_secs(120));
        assert_eq!(backoff_for_attempt(10), RETRY_CAP);
    }
}
