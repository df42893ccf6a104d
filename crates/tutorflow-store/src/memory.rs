//! In-memory store adapter
//!
//! Typed tables behind one mutex. This is the substrate for the workspace
//! test suite and the CLI's `--store memory` smoke mode; it implements the
//! identical contract (and shares the merge policy) with [`crate::PgStore`].
//! The single mutex makes every RPC atomic, which is exactly the behavior
//! the row-locked Postgres adapter provides per statement.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use tutorflow_enrich::haversine_km;
use tutorflow_model::{
    Assignment, AssignmentDraft, AssignmentStatus, BroadcastRecord, ClickRecord, DuplicateGroup,
    ExtractionJob, FreshnessTier, GroupStatus, JobMeta, JobStatus, RawMessage, TutorProfile,
    TutorRating,
};
use tutorflow_utils::error::StoreError;

use crate::listing::{
    Cursor, Facets, ListFilters, ListQuery, ListedAssignment, MAX_PAGE_LIMIT, Page, SortOrder,
};
use crate::merge::apply_merge;
use crate::{NewRawMessage, Store, TerminateRequest};

#[derive(Default)]
struct Inner {
    raw_seq: i64,
    raws: BTreeMap<i64, RawMessage>,
    raw_index: HashMap<(String, String), i64>,

    job_seq: i64,
    jobs: BTreeMap<i64, ExtractionJob>,
    job_index: HashMap<(i64, String), i64>,

    assign_seq: i64,
    assignments: BTreeMap<i64, Assignment>,
    assign_index: HashMap<(String, String), i64>,

    group_seq: i64,
    groups: BTreeMap<i64, DuplicateGroup>,

    clicks: HashMap<String, ClickRecord>,
    broadcasts: HashMap<String, BroadcastRecord>,

    tutors: BTreeMap<i64, TutorProfile>,
    ratings: Vec<TutorRating>,
    dm_log: HashSet<(i64, i64)>,
}

/// In-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Tie-break key for primary selection: `published_at asc` (falling back to
/// `created_at`), then `id asc`.
fn primary_key(a: &Assignment) -> (DateTime<Utc>, i64) {
    (a.published_at.unwrap_or(a.created_at), a.id)
}

impl Inner {
    fn members_of(&self, group_id: i64) -> Vec<i64> {
        self.assignments
            .values()
            .filter(|a| a.duplicate_group_id == Some(group_id))
            .map(|a| a.id)
            .collect()
    }

    /// Re-elect the primary among open members; exactly one member ends up
    /// with `is_primary_in_group = true`. With no open members the group
    /// resolves.
    fn recompute_primary(&mut self, group_id: i64, now: DateTime<Utc>) -> Option<i64> {
        let member_ids = self.members_of(group_id);
        let winner = member_ids
            .iter()
            .filter_map(|id| self.assignments.get(id))
            .filter(|a| a.status == AssignmentStatus::Open)
            .min_by_key(|a| primary_key(a))
            .map(|a| a.id);

        for id in &member_ids {
            if let Some(a) = self.assignments.get_mut(id) {
                a.is_primary_in_group = Some(a.id) == winner;
            }
        }
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.primary_assignment_id = winner;
            group.member_count = member_ids.len() as i32;
            group.updated_at = now;
            if winner.is_none() {
                group.status = GroupStatus::Resolved;
            }
        }
        winner
    }

    fn refresh_group_confidence(&mut self, group_id: i64) {
        let scores: Vec<f64> = self
            .assignments
            .values()
            .filter(|a| a.duplicate_group_id == Some(group_id))
            .filter_map(|a| a.duplicate_confidence_score)
            .collect();
        if let Some(group) = self.groups.get_mut(&group_id)
            && !scores.is_empty()
        {
            group.avg_confidence_score = scores.iter().sum::<f64>() / scores.len() as f64;
        }
    }
}

/// Whether an assignment passes the filter set.
fn matches_filters(a: &Assignment, filters: &ListFilters) -> bool {
    if a.status != AssignmentStatus::Open {
        return false;
    }
    if !filters.show_duplicates() && !a.is_primary_in_group {
        return false;
    }
    if let Some(level) = &filters.level
        && !a.signals_levels.iter().any(|l| l.eq_ignore_ascii_case(level))
    {
        return false;
    }
    if let Some(specific) = &filters.specific_level
        && !a
            .signals_specific_student_levels
            .iter()
            .any(|l| l.eq_ignore_ascii_case(specific))
    {
        return false;
    }
    if let Some(subject) = &filters.subject {
        let hit = a
            .signals_subjects
            .iter()
            .chain(a.subjects_canonical.iter())
            .chain(a.subjects_general.iter())
            .any(|s| s.eq_ignore_ascii_case(subject));
        if !hit {
            return false;
        }
    }
    if let Some(code) = &filters.general_code
        && !a.subjects_general.iter().any(|c| c == code)
    {
        return false;
    }
    if let Some(code) = &filters.canonical_code
        && !a.subjects_canonical.iter().any(|c| c == code)
    {
        return false;
    }
    if let Some(agency) = &filters.agency
        && a.agency_id != *agency
    {
        return false;
    }
    if let Some(mode) = &filters.learning_mode
        && a.learning_mode.as_deref() != Some(mode.as_str())
    {
        return false;
    }
    if let Some(tutor_type) = &filters.tutor_type
        && !a.tutor_types.iter().any(|t| t.kind.eq_ignore_ascii_case(tutor_type))
    {
        return false;
    }
    if let Some(min_rate) = filters.min_rate {
        match a.rate_range() {
            Some((_, max)) if max >= min_rate => {}
            _ => return false,
        }
    }
    if let Some(location) = &filters.location_text {
        if let Ok(region) = location.parse::<tutorflow_model::Region>() {
            if a.region != Some(region) {
                return false;
            }
        } else {
            let needle = location.to_ascii_lowercase();
            let hit = a
                .address
                .iter()
                .chain(a.postal_code.iter())
                .any(|text| text.to_ascii_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
    }
    true
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

/// Distance sort key in metres; missing coordinates sort last.
fn distance_key_m(a: &Assignment, origin: Option<(f64, f64)>) -> (i64, Option<f64>) {
    match (origin, a.postal_lat, a.postal_lon) {
        (Some((lat, lon)), Some(alat), Some(alon)) => {
            let km = haversine_km(lat, lon, alat, alon);
            ((km * 1000.0).round() as i64, Some(km))
        }
        _ => (i64::MAX, None),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_raw(&self, raw: NewRawMessage) -> Result<RawMessage, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        let key = (raw.channel.clone(), raw.message_id.clone());
        if let Some(&existing_id) = inner.raw_index.get(&key) {
            let row = inner
                .raws
                .get_mut(&existing_id)
                .ok_or(StoreError::NotFound {
                    entity: "raw_message",
                    key: existing_id.to_string(),
                })?;
            row.edited_at = raw.edited_at.or(row.edited_at);
            row.payload = raw.payload;
            return Ok(row.clone());
        }
        inner.raw_seq += 1;
        let id = inner.raw_seq;
        let row = RawMessage {
            id,
            channel: raw.channel,
            message_id: raw.message_id,
            agency_id: raw.agency_id,
            text: raw.text,
            published_at: raw.published_at,
            edited_at: raw.edited_at,
            payload: raw.payload,
            created_at: now,
            deleted_at: None,
        };
        inner.raw_index.insert(key, id);
        inner.raws.insert(id, row.clone());
        Ok(row)
    }

    async fn get_raw(&self, raw_id: i64) -> Result<Option<RawMessage>, StoreError> {
        Ok(self.lock().raws.get(&raw_id).cloned())
    }

    async fn enqueue(
        &self,
        pipeline_version: &str,
        channel: &str,
        message_ids: &[String],
        force: bool,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut pending = 0u64;
        for message_id in message_ids {
            let key = (channel.to_string(), message_id.clone());
            let Some(&raw_id) = inner.raw_index.get(&key) else {
                continue;
            };
            let job_key = (raw_id, pipeline_version.to_string());
            if let Some(&job_id) = inner.job_index.get(&job_key) {
                let job = inner.jobs.get_mut(&job_id).ok_or(StoreError::NotFound {
                    entity: "extraction_job",
                    key: job_id.to_string(),
                })?;
                if job.status == JobStatus::Ok && !force {
                    continue;
                }
                job.status = JobStatus::Pending;
                job.error = None;
                job.meta.requeue_reason = Some("re-enqueued".to_string());
                job.meta.not_before = None;
                job.updated_at = now;
                pending += 1;
            } else {
                inner.job_seq += 1;
                let id = inner.job_seq;
                let job = ExtractionJob {
                    id,
                    raw_id,
                    pipeline_version: pipeline_version.to_string(),
                    status: JobStatus::Pending,
                    created_at: now,
                    updated_at: now,
                    meta: JobMeta::default(),
                    error: None,
                    llm_model: None,
                };
                inner.job_index.insert(job_key, id);
                inner.jobs.insert(id, job);
                pending += 1;
            }
        }
        Ok(pending)
    }

    async fn claim(
        &self,
        pipeline_version: &str,
        limit: usize,
    ) -> Result<Vec<ExtractionJob>, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut eligible: Vec<(DateTime<Utc>, i64)> = inner
            .jobs
            .values()
            .filter(|j| j.pipeline_version == pipeline_version && j.status == JobStatus::Pending)
            .filter(|j| j.meta.not_before.is_none_or(|nb| nb <= now))
            .map(|j| (j.created_at, j.id))
            .collect();
        eligible.sort();
        eligible.truncate(limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, id) in eligible {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.status = JobStatus::Processing;
                job.meta.attempt += 1;
                job.meta.processing_started_at = Some(now);
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        let threshold = now
            - ChronoDuration::from_std(older_than)
                .unwrap_or_else(|_| ChronoDuration::seconds(0));
        let mut count = 0u64;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Processing && job.updated_at <= threshold {
                job.status = JobStatus::Pending;
                job.meta.requeue_reason = Some("stale_requeue".to_string());
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn terminate(&self, job_id: i64, request: TerminateRequest) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        let job = inner.jobs.get_mut(&job_id).ok_or(StoreError::NotFound {
            entity: "extraction_job",
            key: job_id.to_string(),
        })?;
        if job.status != JobStatus::Processing && !request.supervisor {
            return Err(StoreError::InvalidTransition {
                job_id,
                from: job.status.to_string(),
                to: request.status.to_string(),
            });
        }
        job.status = request.status;
        job.error = request.error;
        if let Some(err) = &job.error {
            job.meta.last_error_stage = Some(err.stage.clone());
        }
        if !request.assignment_ids.is_empty() {
            job.meta.assignment_ids = request.assignment_ids;
        }
        if let Some(model) = request.llm_model {
            job.llm_model = Some(model);
        }
        job.meta.requeue_reason = request.requeue_reason;
        job.meta.not_before = request.not_before;
        job.updated_at = now;
        Ok(())
    }

    async fn touch_job(&self, job_id: i64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&job_id).ok_or(StoreError::NotFound {
            entity: "extraction_job",
            key: job_id.to_string(),
        })?;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<ExtractionJob>, StoreError> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn count_jobs(
        &self,
        pipeline_version: &str,
        status: JobStatus,
    ) -> Result<u64, StoreError> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.pipeline_version == pipeline_version && j.status == status)
            .count() as u64)
    }

    async fn upsert_assignment(&self, draft: AssignmentDraft) -> Result<Assignment, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        let key = (draft.agency_id.clone(), draft.external_id.clone());

        if let Some(&id) = inner.assign_index.get(&key) {
            let row = inner.assignments.get_mut(&id).ok_or(StoreError::NotFound {
                entity: "assignment",
                key: id.to_string(),
            })?;
            apply_merge(row, &draft, now);
            return Ok(row.clone());
        }

        inner.assign_seq += 1;
        let id = inner.assign_seq;
        let published_at = draft.published_at;
        let source_last_seen = draft.source_last_seen.or(published_at);
        let row = Assignment {
            id,
            agency_id: draft.agency_id,
            external_id: draft.external_id,
            assignment_code: draft.assignment_code,
            message_link: draft.message_link,
            academic_display_text: draft.academic_display_text,
            lesson_schedule: draft.lesson_schedule,
            start_date: draft.start_date,
            time_availability_note: draft.time_availability_note,
            tutor_types: draft.tutor_types,
            rate_raw_text: draft.rate_raw_text,
            rate_breakdown: draft.rate_breakdown,
            learning_mode: draft.learning_mode,
            address: draft.address,
            postal_code: draft.postal_code,
            postal_code_estimated: draft.postal_code_estimated,
            postal_lat: draft.postal_lat,
            postal_lon: draft.postal_lon,
            postal_coords_estimated: draft.postal_coords_estimated,
            region: draft.region,
            nearest_mrt_computed: draft.nearest_mrt_computed,
            nearest_mrt_computed_line: draft.nearest_mrt_computed_line,
            nearest_mrt_computed_distance_m: draft.nearest_mrt_computed_distance_m,
            rate_min: draft.rate_min,
            rate_max: draft.rate_max,
            signals_subjects: draft.signals_subjects,
            signals_levels: draft.signals_levels,
            signals_specific_student_levels: draft.signals_specific_student_levels,
            subjects_canonical: draft.subjects_canonical,
            subjects_general: draft.subjects_general,
            canonicalization_version: draft.canonicalization_version,
            created_at: now,
            published_at,
            source_last_seen,
            last_seen: now,
            status: AssignmentStatus::Open,
            freshness_tier: FreshnessTier::Green,
            bump_count: 0,
            duplicate_group_id: None,
            is_primary_in_group: true,
            duplicate_confidence_score: None,
        };
        inner.assign_index.insert(key, id);
        inner.assignments.insert(id, row.clone());
        Ok(row)
    }

    async fn get_assignment(&self, id: i64) -> Result<Option<Assignment>, StoreError> {
        Ok(self.lock().assignments.get(&id).cloned())
    }

    async fn get_assignment_by_identity(
        &self,
        agency_id: &str,
        external_id: &str,
    ) -> Result<Option<Assignment>, StoreError> {
        let inner = self.lock();
        let id = inner
            .assign_index
            .get(&(agency_id.to_string(), external_id.to_string()));
        Ok(id.and_then(|id| inner.assignments.get(id).cloned()))
    }

    async fn set_assignment_status(
        &self,
        id: i64,
        status: AssignmentStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let row = inner.assignments.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "assignment",
            key: id.to_string(),
        })?;
        row.status = status;
        Ok(())
    }

    async fn increment_clicks(
        &self,
        external_id: &str,
        original_url: Option<&str>,
        delta: i64,
    ) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        let applied = delta.max(0);
        let record = inner
            .clicks
            .entry(external_id.to_string())
            .or_insert_with(|| ClickRecord {
                external_id: external_id.to_string(),
                click_count: 0,
                original_url: None,
                updated_at: now,
            });
        record.click_count += applied;
        if let Some(url) = original_url {
            record.original_url = Some(url.to_string());
        }
        record.updated_at = now;
        let count = record.click_count;
        if let Some(broadcast) = inner.broadcasts.get_mut(external_id) {
            broadcast.updated_at = now;
        }
        Ok(count)
    }

    async fn get_clicks(&self, external_id: &str) -> Result<Option<ClickRecord>, StoreError> {
        Ok(self.lock().clicks.get(external_id).cloned())
    }

    async fn record_broadcast(&self, record: BroadcastRecord) -> Result<(), StoreError> {
        self.lock()
            .broadcasts
            .insert(record.external_id.clone(), record);
        Ok(())
    }

    async fn get_broadcast(
        &self,
        external_id: &str,
    ) -> Result<Option<BroadcastRecord>, StoreError> {
        Ok(self.lock().broadcasts.get(external_id).cloned())
    }

    async fn dedup_candidates(
        &self,
        assignment: &Assignment,
        window_days: i64,
        limit: usize,
    ) -> Result<Vec<Assignment>, StoreError> {
        let inner = self.lock();
        let cutoff = Utc::now() - ChronoDuration::days(window_days);
        let mut candidates: Vec<Assignment> = inner
            .assignments
            .values()
            .filter(|c| {
                c.id != assignment.id
                    && c.status == AssignmentStatus::Open
                    && c.agency_id != assignment.agency_id
                    && c.published_at.is_some_and(|p| p >= cutoff)
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|c| (std::cmp::Reverse(c.published_at), c.id));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn get_group(&self, group_id: i64) -> Result<Option<DuplicateGroup>, StoreError> {
        Ok(self.lock().groups.get(&group_id).cloned())
    }

    async fn group_members(&self, group_id: i64) -> Result<Vec<Assignment>, StoreError> {
        let inner = self.lock();
        let mut members: Vec<Assignment> = inner
            .assignments
            .values()
            .filter(|a| a.duplicate_group_id == Some(group_id))
            .cloned()
            .collect();
        members.sort_by_key(|a| a.id);
        Ok(members)
    }

    async fn create_group(
        &self,
        members: &[(i64, f64)],
        algorithm_version: i32,
    ) -> Result<DuplicateGroup, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        for (id, _) in members {
            if !inner.assignments.contains_key(id) {
                return Err(StoreError::NotFound {
                    entity: "assignment",
                    key: id.to_string(),
                });
            }
        }
        inner.group_seq += 1;
        let group_id = inner.group_seq;
        let avg = if members.is_empty() {
            0.0
        } else {
            members.iter().map(|(_, s)| *s).sum::<f64>() / members.len() as f64
        };
        inner.groups.insert(
            group_id,
            DuplicateGroup {
                id: group_id,
                primary_assignment_id: None,
                member_count: members.len() as i32,
                avg_confidence_score: avg,
                status: GroupStatus::Active,
                detection_algorithm_version: algorithm_version,
                meta: serde_json::Value::Null,
                created_at: now,
                updated_at: now,
            },
        );
        for (id, score) in members {
            if let Some(a) = inner.assignments.get_mut(id) {
                a.duplicate_group_id = Some(group_id);
                a.duplicate_confidence_score = Some(*score);
            }
        }
        inner.recompute_primary(group_id, now);
        self_group(&inner, group_id)
    }

    async fn link_to_group(
        &self,
        group_id: i64,
        assignment_id: i64,
        score: f64,
    ) -> Result<DuplicateGroup, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        if !inner.groups.contains_key(&group_id) {
            return Err(StoreError::NotFound {
                entity: "duplicate_group",
                key: group_id.to_string(),
            });
        }
        let a = inner
            .assignments
            .get_mut(&assignment_id)
            .ok_or(StoreError::NotFound {
                entity: "assignment",
                key: assignment_id.to_string(),
            })?;
        a.duplicate_group_id = Some(group_id);
        a.duplicate_confidence_score = Some(score);
        inner.recompute_primary(group_id, now);
        inner.refresh_group_confidence(group_id);
        self_group(&inner, group_id)
    }

    async fn merge_groups(
        &self,
        group_ids: &[i64],
        new_member: (i64, f64),
        algorithm_version: i32,
    ) -> Result<DuplicateGroup, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        // Deterministic lock order is moot under one mutex, but the target
        // selection mirrors the Postgres adapter: earliest created, then id.
        let mut sorted: Vec<i64> = group_ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let target = sorted
            .iter()
            .filter_map(|id| inner.groups.get(id).map(|g| (g.created_at, g.id)))
            .min()
            .map(|(_, id)| id)
            .ok_or(StoreError::NotFound {
                entity: "duplicate_group",
                key: format!("{group_ids:?}"),
            })?;

        let moved: Vec<i64> = inner
            .assignments
            .values()
            .filter(|a| {
                a.duplicate_group_id
                    .is_some_and(|g| sorted.contains(&g) && g != target)
            })
            .map(|a| a.id)
            .collect();
        for id in moved {
            if let Some(a) = inner.assignments.get_mut(&id) {
                a.duplicate_group_id = Some(target);
            }
        }
        let (new_id, score) = new_member;
        let a = inner
            .assignments
            .get_mut(&new_id)
            .ok_or(StoreError::NotFound {
                entity: "assignment",
                key: new_id.to_string(),
            })?;
        a.duplicate_group_id = Some(target);
        a.duplicate_confidence_score = Some(score);

        for id in &sorted {
            if *id != target
                && let Some(group) = inner.groups.get_mut(id)
            {
                group.status = GroupStatus::Resolved;
                group.member_count = 0;
                group.primary_assignment_id = None;
                group.updated_at = now;
            }
        }
        if let Some(group) = inner.groups.get_mut(&target) {
            group.detection_algorithm_version = algorithm_version;
        }
        inner.recompute_primary(target, now);
        inner.refresh_group_confidence(target);
        self_group(&inner, target)
    }

    async fn promote_next_primary(&self, group_id: i64) -> Result<Option<i64>, StoreError> {
        let mut inner = self.lock();
        if !inner.groups.contains_key(&group_id) {
            return Err(StoreError::NotFound {
                entity: "duplicate_group",
                key: group_id.to_string(),
            });
        }
        Ok(inner.recompute_primary(group_id, Utc::now()))
    }

    async fn open_assignments_after(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<Assignment>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .assignments
            .range((after_id + 1)..)
            .filter(|(_, a)| a.status == AssignmentStatus::Open)
            .take(limit)
            .map(|(_, a)| a.clone())
            .collect())
    }

    async fn set_freshness_tiers(
        &self,
        updates: &[(i64, FreshnessTier)],
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let mut changed = 0u64;
        for (id, tier) in updates {
            if let Some(a) = inner.assignments.get_mut(id)
                && a.freshness_tier != *tier
            {
                a.freshness_tier = *tier;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn list_open(&self, query: ListQuery) -> Result<Page, StoreError> {
        let inner = self.lock();
        let limit = if query.limit == 0 {
            50
        } else {
            query.limit.min(MAX_PAGE_LIMIT)
        };
        let cursor = query
            .cursor
            .as_deref()
            .map(|raw| Cursor::decode(raw, query.sort))
            .transpose()?;

        let mut rows: Vec<(&Assignment, i64, Option<f64>)> = inner
            .assignments
            .values()
            .filter(|a| matches_filters(a, &query.filters))
            .map(|a| {
                let (key, km) = distance_key_m(a, query.origin);
                (a, key, km)
            })
            .collect();

        let total_count = rows.len() as u64;

        match query.sort {
            SortOrder::Newest => {
                rows.sort_by_key(|(a, _, _)| (std::cmp::Reverse(micros(a.sort_ts())), std::cmp::Reverse(a.id)));
            }
            SortOrder::Distance => {
                rows.sort_by_key(|(a, key, _)| {
                    (*key, std::cmp::Reverse(micros(a.last_seen)), std::cmp::Reverse(a.id))
                });
            }
        }

        if let Some(cursor) = cursor {
            rows.retain(|(a, key, _)| match cursor {
                Cursor::Newest { sort_ts_micros, id } => {
                    let ts = micros(a.sort_ts());
                    ts < sort_ts_micros || (ts == sort_ts_micros && a.id < id)
                }
                Cursor::Distance {
                    distance_key_m,
                    last_seen_micros,
                    id,
                } => {
                    let ls = micros(a.last_seen);
                    *key > distance_key_m
                        || (*key == distance_key_m && ls < last_seen_micros)
                        || (*key == distance_key_m && ls == last_seen_micros && a.id < id)
                }
            });
        }

        let has_more = rows.len() > limit;
        rows.truncate(limit);

        let next_cursor = if has_more {
            rows.last().map(|(a, key, _)| match query.sort {
                SortOrder::Newest => Cursor::Newest {
                    sort_ts_micros: micros(a.sort_ts()),
                    id: a.id,
                }
                .encode(),
                SortOrder::Distance => Cursor::Distance {
                    distance_key_m: *key,
                    last_seen_micros: micros(a.last_seen),
                    id: a.id,
                }
                .encode(),
            })
        } else {
            None
        };

        Ok(Page {
            rows: rows
                .into_iter()
                .map(|(a, _, km)| ListedAssignment {
                    assignment: a.clone(),
                    distance_km: km,
                })
                .collect(),
            total_count,
            next_cursor,
        })
    }

    async fn facets(&self, filters: ListFilters) -> Result<Facets, StoreError> {
        let inner = self.lock();
        let mut agencies: HashMap<String, u64> = HashMap::new();
        let mut regions: HashMap<String, u64> = HashMap::new();
        let mut levels: HashMap<String, u64> = HashMap::new();
        let mut generals: HashMap<String, u64> = HashMap::new();
        for a in inner.assignments.values().filter(|a| matches_filters(a, &filters)) {
            *agencies.entry(a.agency_id.clone()).or_default() += 1;
            if let Some(region) = a.region {
                *regions.entry(region.to_string()).or_default() += 1;
            }
            for level in &a.signals_levels {
                *levels.entry(level.clone()).or_default() += 1;
            }
            for code in &a.subjects_general {
                *generals.entry(code.clone()).or_default() += 1;
            }
        }
        let sorted = |map: HashMap<String, u64>| {
            let mut v: Vec<(String, u64)> = map.into_iter().collect();
            v.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            v
        };
        Ok(Facets {
            agencies: sorted(agencies),
            regions: sorted(regions),
            levels: sorted(levels),
            subjects_general: sorted(generals),
        })
    }

    async fn upsert_tutor(&self, profile: TutorProfile) -> Result<(), StoreError> {
        self.lock().tutors.insert(profile.id, profile);
        Ok(())
    }

    async fn active_tutors(&self) -> Result<Vec<TutorProfile>, StoreError> {
        Ok(self
            .lock()
            .tutors
            .values()
            .filter(|t| t.active)
            .cloned()
            .collect())
    }

    async fn record_rating(&self, rating: TutorRating) -> Result<(), StoreError> {
        self.lock().ratings.push(rating);
        Ok(())
    }

    async fn tutor_rating_threshold(
        &self,
        tutor_id: i64,
        percentile: f64,
    ) -> Result<Option<f64>, StoreError> {
        let inner = self.lock();
        let mut scores: Vec<f64> = inner
            .ratings
            .iter()
            .filter(|r| r.tutor_id == tutor_id)
            .map(|r| r.rating)
            .collect();
        if scores.is_empty() {
            return Ok(None);
        }
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let p = percentile.clamp(0.0, 100.0) / 100.0;
        // Nearest-rank percentile
        let rank = ((p * scores.len() as f64).ceil() as usize).clamp(1, scores.len());
        Ok(Some(scores[rank - 1]))
    }

    async fn tutor_avg_rate(&self, tutor_id: i64) -> Result<Option<f64>, StoreError> {
        let inner = self.lock();
        let rates: Vec<f64> = inner
            .ratings
            .iter()
            .filter(|r| r.tutor_id == tutor_id)
            .filter_map(|r| inner.assignments.get(&r.assignment_id))
            .filter_map(|a| a.rate_range())
            .map(|(min, max)| (min + max) as f64 / 2.0)
            .collect();
        if rates.is_empty() {
            return Ok(None);
        }
        Ok(Some(rates.iter().sum::<f64>() / rates.len() as f64))
    }

    async fn mark_dm_sent(&self, tutor_id: i64, assignment_id: i64) -> Result<bool, StoreError> {
        Ok(self.lock().dm_log.insert((tutor_id, assignment_id)))
    }
}

/// Snapshot a group row out of the locked state.
fn self_group(
    inner: &std::sync::MutexGuard<'_, Inner>,
    group_id: i64,
) -> Result<DuplicateGroup, StoreError> {
    inner
        .groups
        .get(&group_id)
        .cloned()
        .ok_or(StoreError::NotFound {
            entity: "duplicate_group",
            key: group_id.to_string(),
        })
}
