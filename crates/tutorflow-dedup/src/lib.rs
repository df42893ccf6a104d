//! Cross-agency duplicate detection
//!
//! Given one newly persisted assignment, find open postings from other
//! agencies advertising the same opportunity, and link them into a
//! duplicate group. Scoring is a weighted sum over independent signals;
//! group transitions are delegated to the store's atomic operations, and
//! detector failures never block the upsert that triggered them.

pub mod scoring;

use std::sync::Arc;
use tracing::{debug, info, warn};

use tutorflow_config::DedupConfig;
use tutorflow_model::Assignment;
use tutorflow_store::Store;
use tutorflow_utils::error::DedupError;

pub use scoring::{ScoreBreakdown, score_pair};

/// Version stamped on groups created or merged by this scorer. Bump when
/// the signal set or weights semantics change.
pub const DETECTION_ALGORITHM_VERSION: i32 = 2;

/// One candidate that crossed the linking threshold.
#[derive(Debug, Clone)]
struct Match {
    candidate: Assignment,
    score: f64,
}

/// Result of one detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionOutcome {
    /// No candidate crossed the threshold; the assignment stays unlinked.
    NoMatch,
    /// Linked into a group (created, joined, or merged).
    Linked { group_id: i64 },
}

/// The duplicate detector. Configuration is read once at construction.
pub struct DuplicateDetector {
    store: Arc<dyn Store>,
    config: DedupConfig,
}

impl DuplicateDetector {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: DedupConfig) -> Self {
        Self { store, config }
    }

    /// Run a detection pass for one newly upserted assignment.
    ///
    /// # Errors
    ///
    /// Returns `DedupError`; callers log and move on, the upsert stands.
    pub async fn process(&self, assignment: &Assignment) -> Result<DetectionOutcome, DedupError> {
        let candidates = self
            .store
            .dedup_candidates(
                assignment,
                self.config.dup_time_window_days,
                self.config.dup_batch_size,
            )
            .await
            .map_err(|e| DedupError::CandidateQuery(e.to_string()))?;

        let matches: Vec<Match> = candidates
            .into_iter()
            .filter_map(|candidate| {
                let score = score_pair(
                    assignment,
                    &candidate,
                    &self.config.dup_weights,
                    self.config.dup_fuzzy_postal_tolerance,
                )
                .total;
                (score >= self.config.dup_threshold).then_some(Match { candidate, score })
            })
            .collect();

        if matches.is_empty() {
            debug!(assignment_id = assignment.id, "no duplicate candidates crossed threshold");
            return Ok(DetectionOutcome::NoMatch);
        }

        // Groups referenced by the matched set (and the assignment itself,
        // when a reprocessing already linked it).
        let mut group_ids: Vec<i64> = matches
            .iter()
            .filter_map(|m| m.candidate.duplicate_group_id)
            .chain(assignment.duplicate_group_id)
            .collect();
        group_ids.sort_unstable();
        group_ids.dedup();

        let mean_score =
            matches.iter().map(|m| m.score).sum::<f64>() / matches.len() as f64;
        let best_score = matches
            .iter()
            .map(|m| m.score)
            .fold(f64::MIN, f64::max);

        let group_id = match group_ids.as_slice() {
            // No pre-existing group: create one over the new assignment and
            // every matched candidate.
            [] => {
                let mut members: Vec<(i64, f64)> = vec![(assignment.id, mean_score)];
                members.extend(matches.iter().map(|m| (m.candidate.id, m.score)));
                let group = self
                    .store
                    .create_group(&members, DETECTION_ALGORITHM_VERSION)
                    .await
                    .map_err(|e| DedupError::GroupTransition {
                        group_id: 0,
                        reason: e.to_string(),
                    })?;
                info!(
                    assignment_id = assignment.id,
                    group_id = group.id,
                    members = group.member_count,
                    avg_confidence = group.avg_confidence_score,
                    "created duplicate group"
                );
                group.id
            }
            // Exactly one group referenced: link in.
            [only] => {
                let group = self
                    .store
                    .link_to_group(*only, assignment.id, best_score)
                    .await
                    .map_err(|e| DedupError::GroupTransition {
                        group_id: *only,
                        reason: e.to_string(),
                    })?;
                info!(
                    assignment_id = assignment.id,
                    group_id = group.id,
                    members = group.member_count,
                    "linked into duplicate group"
                );
                group.id
            }
            // Transitive linkage via this assignment: merge.
            many => {
                let group = self
                    .store
                    .merge_groups(many, (assignment.id, best_score), DETECTION_ALGORITHM_VERSION)
                    .await
                    .map_err(|e| DedupError::GroupTransition {
                        group_id: many[0],
                        reason: e.to_string(),
                    })?;
                warn!(
                    assignment_id = assignment.id,
                    merged = many.len(),
                    group_id = group.id,
                    "merged duplicate groups via transitive link"
                );
                group.id
            }
        };

        Ok(DetectionOutcome::Linked { group_id })
    }

    /// After a group member closed: re-elect the primary (or resolve the
    /// group when no open member remains).
    ///
    /// # Errors
    ///
    /// Returns `DedupError::GroupTransition` when the store rejects the
    /// promotion.
    pub async fn on_member_closed(&self, group_id: i64) -> Result<Option<i64>, DedupError> {
        self.store
            .promote_next_primary(group_id)
            .await
            .map_err(|e| DedupError::GroupTransition {
                group_id,
                reason: e.to_string(),
            })
    }
}
