//! Canonical store: the single shared mutable resource
//!
//! [`Store`] is the object-safe contract every consumer programs against.
//! Two implementations exist: [`PgStore`] (Postgres via sqlx; skip-locked
//! claims, `ON CONFLICT` upserts, GIN-indexed arrays) and [`MemoryStore`]
//! (typed tables behind one mutex; the test substrate and the `--store
//! memory` smoke mode). Both enforce the same merge policy via
//! [`merge::apply_merge`].

pub mod listing;
pub mod memory;
pub mod merge;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use tutorflow_model::{
    Assignment, AssignmentDraft, AssignmentStatus, BroadcastRecord, ClickRecord, DuplicateGroup,
    ExtractionJob, FreshnessTier, JobError, JobStatus, RawMessage, TutorProfile, TutorRating,
};
use tutorflow_utils::error::StoreError;

pub use listing::{Facets, ListFilters, ListQuery, ListedAssignment, Page, SortOrder};
pub use memory::MemoryStore;
pub use pg::PgStore;

/// Input for seeding a raw message (collector-side write, also used by
/// tests).
#[derive(Debug, Clone)]
pub struct NewRawMessage {
    pub channel: String,
    pub message_id: String,
    pub agency_id: String,
    pub text: String,
    pub published_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

/// Final state transition for a claimed job.
#[derive(Debug, Clone, Default)]
pub struct TerminateRequest {
    pub status: JobStatus,
    pub error: Option<JobError>,
    /// Assignments produced by a successful run.
    pub assignment_ids: Vec<i64>,
    pub llm_model: Option<String>,
    /// Reason stamped into `meta` on requeue transitions.
    pub requeue_reason: Option<String>,
    /// Backoff floor for the next claim, on requeue transitions.
    pub not_before: Option<DateTime<Utc>>,
    /// Supervisors may transition jobs that are not `processing`.
    pub supervisor: bool,
}

/// The store contract.
///
/// Every method is a potential suspension point and must be cancel-safe;
/// no method holds locks across its own await points beyond a single
/// transaction.
#[async_trait]
pub trait Store: Send + Sync {
    // --- raw messages -----------------------------------------------------

    /// Insert one raw message; `(channel, message_id)` conflicts return the
    /// existing row with `edited_at`/`payload` refreshed.
    async fn insert_raw(&self, raw: NewRawMessage) -> Result<RawMessage, StoreError>;

    async fn get_raw(&self, raw_id: i64) -> Result<Option<RawMessage>, StoreError>;

    // --- job queue --------------------------------------------------------

    /// Upsert one job per referenced raw row. Conflicting `ok` rows are
    /// left untouched unless `force`; all other conflicts reset to
    /// `pending`. Returns the number of jobs now pending because of this
    /// call.
    async fn enqueue(
        &self,
        pipeline_version: &str,
        channel: &str,
        message_ids: &[String],
        force: bool,
    ) -> Result<u64, StoreError>;

    /// Atomically claim up to `limit` oldest pending jobs for the version,
    /// in `(created_at, id)` order. Concurrent claimers never overlap.
    async fn claim(
        &self,
        pipeline_version: &str,
        limit: usize,
    ) -> Result<Vec<ExtractionJob>, StoreError>;

    /// Return abandoned `processing` jobs (stale `updated_at`) to
    /// `pending`. `Duration::ZERO` requeues everything currently
    /// processing.
    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, StoreError>;

    /// Final transition for a claimed job. Rejects transitions from
    /// non-`processing` states unless `request.supervisor`.
    async fn terminate(&self, job_id: i64, request: TerminateRequest) -> Result<(), StoreError>;

    /// Heartbeat: refresh `updated_at` on an in-flight job so the stale
    /// sweep leaves it alone.
    async fn touch_job(&self, job_id: i64) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: i64) -> Result<Option<ExtractionJob>, StoreError>;

    /// Count jobs for a version in a given status (operator surface).
    async fn count_jobs(
        &self,
        pipeline_version: &str,
        status: JobStatus,
    ) -> Result<u64, StoreError>;

    // --- assignments ------------------------------------------------------

    /// Idempotent upsert with the per-field merge policy on conflict key
    /// `(agency_id, external_id)`. Returns the merged row.
    async fn upsert_assignment(&self, draft: AssignmentDraft) -> Result<Assignment, StoreError>;

    async fn get_assignment(&self, id: i64) -> Result<Option<Assignment>, StoreError>;

    async fn get_assignment_by_identity(
        &self,
        agency_id: &str,
        external_id: &str,
    ) -> Result<Option<Assignment>, StoreError>;

    /// Flip lifecycle status. Closing never deletes.
    async fn set_assignment_status(
        &self,
        id: i64,
        status: AssignmentStatus,
    ) -> Result<(), StoreError>;

    // --- clicks & broadcast ----------------------------------------------

    /// Atomic insert-or-update click counter: adds `max(0, delta)` and
    /// returns the new count. Also bumps the paired broadcast record's
    /// `updated_at` so the editor loop notices.
    async fn increment_clicks(
        &self,
        external_id: &str,
        original_url: Option<&str>,
        delta: i64,
    ) -> Result<i64, StoreError>;

    async fn get_clicks(&self, external_id: &str) -> Result<Option<ClickRecord>, StoreError>;

    /// Record the last broadcast-delivered content/chat/message tuple.
    async fn record_broadcast(&self, record: BroadcastRecord) -> Result<(), StoreError>;

    async fn get_broadcast(
        &self,
        external_id: &str,
    ) -> Result<Option<BroadcastRecord>, StoreError>;

    // --- duplicate groups -------------------------------------------------

    /// Open assignments from a *different* agency with `published_at`
    /// inside the window, newest first, capped at `limit`.
    async fn dedup_candidates(
        &self,
        assignment: &Assignment,
        window_days: i64,
        limit: usize,
    ) -> Result<Vec<Assignment>, StoreError>;

    async fn get_group(&self, group_id: i64) -> Result<Option<DuplicateGroup>, StoreError>;

    async fn group_members(&self, group_id: i64) -> Result<Vec<Assignment>, StoreError>;

    /// Atomically create a group over `members` (ids paired with their
    /// match confidence). Primary is the tie-break winner (`published_at`
    /// asc, then `id` asc).
    async fn create_group(
        &self,
        members: &[(i64, f64)],
        algorithm_version: i32,
    ) -> Result<DuplicateGroup, StoreError>;

    /// Atomically link one assignment into an existing group, updating
    /// `member_count`, the rolling average confidence, and the primary
    /// tie-break.
    async fn link_to_group(
        &self,
        group_id: i64,
        assignment_id: i64,
        score: f64,
    ) -> Result<DuplicateGroup, StoreError>;

    /// Atomically merge several groups (plus one new member) into the
    /// earliest-created group, reassigning members and recomputing the
    /// primary. Locks groups in ascending id order.
    async fn merge_groups(
        &self,
        group_ids: &[i64],
        new_member: (i64, f64),
        algorithm_version: i32,
    ) -> Result<DuplicateGroup, StoreError>;

    /// After the primary closed: promote the tie-break winner among open
    /// members, or resolve the group when none remain. Returns the new
    /// primary id.
    async fn promote_next_primary(&self, group_id: i64) -> Result<Option<i64>, StoreError>;

    // --- freshness --------------------------------------------------------

    /// Open assignments with `id > after_id`, ascending, for batched
    /// retiering.
    async fn open_assignments_after(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<Assignment>, StoreError>;

    /// Bulk tier update; rows already at the target tier are untouched.
    async fn set_freshness_tiers(
        &self,
        updates: &[(i64, FreshnessTier)],
    ) -> Result<u64, StoreError>;

    // --- listing ----------------------------------------------------------

    /// Keyset-paginated listing of open assignments.
    async fn list_open(&self, query: ListQuery) -> Result<Page, StoreError>;

    /// Facet counts under the same filters.
    async fn facets(&self, filters: ListFilters) -> Result<Facets, StoreError>;

    // --- tutors & ratings -------------------------------------------------

    async fn upsert_tutor(&self, profile: TutorProfile) -> Result<(), StoreError>;

    async fn active_tutors(&self) -> Result<Vec<TutorProfile>, StoreError>;

    async fn record_rating(&self, rating: TutorRating) -> Result<(), StoreError>;

    /// Adaptive rating threshold: the given percentile of the tutor's
    /// historical ratings. `None` until the tutor has rated anything.
    async fn tutor_rating_threshold(
        &self,
        tutor_id: i64,
        percentile: f64,
    ) -> Result<Option<f64>, StoreError>;

    /// Mean hourly rate across assignments the tutor rated.
    async fn tutor_avg_rate(&self, tutor_id: i64) -> Result<Option<f64>, StoreError>;

    /// Per-recipient dedup: record that a DM for `(tutor, assignment)` was
    /// sent. Returns `false` when it already was (caller skips the send).
    async fn mark_dm_sent(&self, tutor_id: i64, assignment_id: i64) -> Result<bool, StoreError>;
}
