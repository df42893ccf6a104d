//! Postgres store adapter
//!
//! Uses the runtime sqlx API throughout. Queue claims rely on
//! `FOR UPDATE SKIP LOCKED`; upserts take a row lock and run the shared
//! merge policy in process so both adapters agree byte-for-byte on merge
//! semantics; group transitions run in one transaction with groups locked
//! in ascending id order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::time::Duration;

use tutorflow_model::{
    Assignment, AssignmentDraft, AssignmentStatus, BroadcastRecord, ClickRecord, DuplicateGroup,
    ExtractionJob, FreshnessTier, GroupStatus, JobError, JobMeta, JobStatus, RawMessage, Region,
    TutorProfile, TutorRating, TutorType,
};
use tutorflow_utils::error::StoreError;

use crate::listing::{
    Cursor, Facets, ListFilters, ListQuery, ListedAssignment, MAX_PAGE_LIMIT, Page, SortOrder,
};
use crate::merge::apply_merge;
use crate::{NewRawMessage, Store, TerminateRequest};

/// Schema migration applied at startup.
const MIGRATION_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Distance sort key for rows without coordinates.
const NO_COORDS_KEY: i64 = i64::MAX;

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Postgres-backed [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with a bounded pool.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` on connection failure.
    pub async fn connect(database_url: &str, pool_size: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests, shared pools).
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the idempotent schema migration.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` on any statement failure.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION_SQL)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

// --- status <-> text -------------------------------------------------------

fn job_status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Processing => "processing",
        JobStatus::Ok => "ok",
        JobStatus::Failed => "failed",
        JobStatus::Skipped => "skipped",
    }
}

fn job_status_parse(s: &str) -> Result<JobStatus, StoreError> {
    match s {
        "pending" => Ok(JobStatus::Pending),
        "processing" => Ok(JobStatus::Processing),
        "ok" => Ok(JobStatus::Ok),
        "failed" => Ok(JobStatus::Failed),
        "skipped" => Ok(JobStatus::Skipped),
        other => Err(StoreError::Database(format!("unknown job status '{other}'"))),
    }
}

fn assignment_status_str(status: AssignmentStatus) -> &'static str {
    match status {
        AssignmentStatus::Open => "open",
        AssignmentStatus::Closed => "closed",
    }
}

fn assignment_status_parse(s: &str) -> Result<AssignmentStatus, StoreError> {
    match s {
        "open" => Ok(AssignmentStatus::Open),
        "closed" => Ok(AssignmentStatus::Closed),
        other => Err(StoreError::Database(format!(
            "unknown assignment status '{other}'"
        ))),
    }
}

fn tier_str(tier: FreshnessTier) -> &'static str {
    match tier {
        FreshnessTier::Green => "green",
        FreshnessTier::Yellow => "yellow",
        FreshnessTier::Orange => "orange",
        FreshnessTier::Red => "red",
    }
}

fn tier_parse(s: &str) -> Result<FreshnessTier, StoreError> {
    match s {
        "green" => Ok(FreshnessTier::Green),
        "yellow" => Ok(FreshnessTier::Yellow),
        "orange" => Ok(FreshnessTier::Orange),
        "red" => Ok(FreshnessTier::Red),
        other => Err(StoreError::Database(format!("unknown tier '{other}'"))),
    }
}

fn group_status_parse(s: &str) -> Result<GroupStatus, StoreError> {
    match s {
        "active" => Ok(GroupStatus::Active),
        "resolved" => Ok(GroupStatus::Resolved),
        other => Err(StoreError::Database(format!(
            "unknown group status '{other}'"
        ))),
    }
}

// --- row mappers -----------------------------------------------------------

fn raw_from_row(row: &PgRow) -> Result<RawMessage, StoreError> {
    Ok(RawMessage {
        id: row.try_get("id").map_err(db_err)?,
        channel: row.try_get("channel").map_err(db_err)?,
        message_id: row.try_get("message_id").map_err(db_err)?,
        agency_id: row.try_get("agency_id").map_err(db_err)?,
        text: row.try_get("text").map_err(db_err)?,
        published_at: row.try_get("published_at").map_err(db_err)?,
        edited_at: row.try_get("edited_at").map_err(db_err)?,
        payload: row.try_get("payload").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        deleted_at: row.try_get("deleted_at").map_err(db_err)?,
    })
}

fn job_from_row(row: &PgRow) -> Result<ExtractionJob, StoreError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let meta_value: serde_json::Value = row.try_get("meta").map_err(db_err)?;
    let error_value: Option<serde_json::Value> = row.try_get("error").map_err(db_err)?;
    let meta: JobMeta = serde_json::from_value(meta_value)?;
    let error: Option<JobError> = match error_value {
        Some(serde_json::Value::Null) | None => None,
        Some(value) => Some(serde_json::from_value(value)?),
    };
    Ok(ExtractionJob {
        id: row.try_get("id").map_err(db_err)?,
        raw_id: row.try_get("raw_id").map_err(db_err)?,
        pipeline_version: row.try_get("pipeline_version").map_err(db_err)?,
        status: job_status_parse(&status)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        meta,
        error,
        llm_model: row.try_get("llm_model").map_err(db_err)?,
    })
}

fn assignment_from_row(row: &PgRow) -> Result<Assignment, StoreError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let tier: String = row.try_get("freshness_tier").map_err(db_err)?;
    let region: Option<String> = row.try_get("region").map_err(db_err)?;
    let tutor_types_value: serde_json::Value = row.try_get("tutor_types").map_err(db_err)?;
    let tutor_types: Vec<TutorType> = serde_json::from_value(tutor_types_value)?;
    Ok(Assignment {
        id: row.try_get("id").map_err(db_err)?,
        agency_id: row.try_get("agency_id").map_err(db_err)?,
        external_id: row.try_get("external_id").map_err(db_err)?,
        assignment_code: row.try_get("assignment_code").map_err(db_err)?,
        message_link: row.try_get("message_link").map_err(db_err)?,
        academic_display_text: row.try_get("academic_display_text").map_err(db_err)?,
        lesson_schedule: row.try_get("lesson_schedule").map_err(db_err)?,
        start_date: row.try_get("start_date").map_err(db_err)?,
        time_availability_note: row.try_get("time_availability_note").map_err(db_err)?,
        tutor_types,
        rate_raw_text: row.try_get("rate_raw_text").map_err(db_err)?,
        rate_breakdown: row.try_get("rate_breakdown").map_err(db_err)?,
        learning_mode: row.try_get("learning_mode").map_err(db_err)?,
        address: row.try_get("address").map_err(db_err)?,
        postal_code: row.try_get("postal_code").map_err(db_err)?,
        postal_code_estimated: row.try_get("postal_code_estimated").map_err(db_err)?,
        postal_lat: row.try_get("postal_lat").map_err(db_err)?,
        postal_lon: row.try_get("postal_lon").map_err(db_err)?,
        postal_coords_estimated: row.try_get("postal_coords_estimated").map_err(db_err)?,
        region: region.and_then(|r| r.parse::<Region>().ok()),
        nearest_mrt_computed: row.try_get("nearest_mrt_computed").map_err(db_err)?,
        nearest_mrt_computed_line: row.try_get("nearest_mrt_computed_line").map_err(db_err)?,
        nearest_mrt_computed_distance_m: row
            .try_get("nearest_mrt_computed_distance_m")
            .map_err(db_err)?,
        rate_min: row.try_get("rate_min").map_err(db_err)?,
        rate_max: row.try_get("rate_max").map_err(db_err)?,
        signals_subjects: row.try_get("signals_subjects").map_err(db_err)?,
        signals_levels: row.try_get("signals_levels").map_err(db_err)?,
        signals_specific_student_levels: row
            .try_get("signals_specific_student_levels")
            .map_err(db_err)?,
        subjects_canonical: row.try_get("subjects_canonical").map_err(db_err)?,
        subjects_general: row.try_get("subjects_general").map_err(db_err)?,
        canonicalization_version: row.try_get("canonicalization_version").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        published_at: row.try_get("published_at").map_err(db_err)?,
        source_last_seen: row.try_get("source_last_seen").map_err(db_err)?,
        last_seen: row.try_get("last_seen").map_err(db_err)?,
        status: assignment_status_parse(&status)?,
        freshness_tier: tier_parse(&tier)?,
        bump_count: row.try_get("bump_count").map_err(db_err)?,
        duplicate_group_id: row.try_get("duplicate_group_id").map_err(db_err)?,
        is_primary_in_group: row.try_get("is_primary_in_group").map_err(db_err)?,
        duplicate_confidence_score: row
            .try_get("duplicate_confidence_score")
            .map_err(db_err)?,
    })
}

fn group_from_row(row: &PgRow) -> Result<DuplicateGroup, StoreError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(DuplicateGroup {
        id: row.try_get("id").map_err(db_err)?,
        primary_assignment_id: row.try_get("primary_assignment_id").map_err(db_err)?,
        member_count: row.try_get("member_count").map_err(db_err)?,
        avg_confidence_score: row.try_get("avg_confidence_score").map_err(db_err)?,
        status: group_status_parse(&status)?,
        detection_algorithm_version: row
            .try_get("detection_algorithm_version")
            .map_err(db_err)?,
        meta: row.try_get("meta").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn tutor_from_row(row: &PgRow) -> Result<TutorProfile, StoreError> {
    Ok(TutorProfile {
        id: row.try_get("id").map_err(db_err)?,
        chat_id: row.try_get("chat_id").map_err(db_err)?,
        subjects: row.try_get("subjects").map_err(db_err)?,
        levels: row.try_get("levels").map_err(db_err)?,
        home_lat: row.try_get("home_lat").map_err(db_err)?,
        home_lon: row.try_get("home_lon").map_err(db_err)?,
        max_distance_km: row.try_get("max_distance_km").map_err(db_err)?,
        rating_threshold_percentile: row
            .try_get("rating_threshold_percentile")
            .map_err(db_err)?,
        active: row.try_get("active").map_err(db_err)?,
    })
}

/// Write every merge-mutable column of an assignment row.
async fn update_assignment_row<'e, E>(executor: E, a: &Assignment) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r"UPDATE assignments SET
            assignment_code = $2, message_link = $3, academic_display_text = $4,
            lesson_schedule = $5, start_date = $6, time_availability_note = $7,
            tutor_types = $8, rate_raw_text = $9, rate_breakdown = $10,
            learning_mode = $11, address = $12, postal_code = $13,
            postal_code_estimated = $14, postal_lat = $15, postal_lon = $16,
            postal_coords_estimated = $17, region = $18, nearest_mrt_computed = $19,
            nearest_mrt_computed_line = $20, nearest_mrt_computed_distance_m = $21,
            rate_min = $22, rate_max = $23, signals_subjects = $24,
            signals_levels = $25, signals_specific_student_levels = $26,
            subjects_canonical = $27, subjects_general = $28,
            canonicalization_version = $29, published_at = $30,
            source_last_seen = $31, last_seen = $32, bump_count = $33
          WHERE id = $1",
    )
    .bind(a.id)
    .bind(&a.assignment_code)
    .bind(&a.message_link)
    .bind(&a.academic_display_text)
    .bind(&a.lesson_schedule)
    .bind(&a.start_date)
    .bind(&a.time_availability_note)
    .bind(serde_json::to_value(&a.tutor_types)?)
    .bind(&a.rate_raw_text)
    .bind(&a.rate_breakdown)
    .bind(&a.learning_mode)
    .bind(&a.address)
    .bind(&a.postal_code)
    .bind(&a.postal_code_estimated)
    .bind(a.postal_lat)
    .bind(a.postal_lon)
    .bind(a.postal_coords_estimated)
    .bind(a.region.map(|r| r.to_string()))
    .bind(&a.nearest_mrt_computed)
    .bind(&a.nearest_mrt_computed_line)
    .bind(a.nearest_mrt_computed_distance_m)
    .bind(a.rate_min)
    .bind(a.rate_max)
    .bind(&a.signals_subjects)
    .bind(&a.signals_levels)
    .bind(&a.signals_specific_student_levels)
    .bind(&a.subjects_canonical)
    .bind(&a.subjects_general)
    .bind(a.canonicalization_version)
    .bind(a.published_at)
    .bind(a.source_last_seen)
    .bind(a.last_seen)
    .bind(a.bump_count)
    .execute(executor)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Append the conjunctive filter clauses; bare column names resolve against
/// whatever relation the caller's FROM clause puts in scope.
fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &ListFilters) {
    if !filters.show_duplicates() {
        qb.push(" AND is_primary_in_group");
    }
    if let Some(level) = &filters.level {
        qb.push(" AND lower(")
            .push_bind(level.clone())
            .push(") IN (SELECT lower(x) FROM unnest(signals_levels) x)");
    }
    if let Some(specific) = &filters.specific_level {
        qb.push(" AND lower(")
            .push_bind(specific.clone())
            .push(") IN (SELECT lower(x) FROM unnest(signals_specific_student_levels) x)");
    }
    if let Some(subject) = &filters.subject {
        qb.push(" AND lower(")
            .push_bind(subject.clone())
            .push(") IN (SELECT lower(x) FROM unnest(signals_subjects || subjects_canonical || subjects_general) x)");
    }
    if let Some(code) = &filters.general_code {
        qb.push(" AND ")
            .push_bind(code.clone())
            .push(" = ANY(subjects_general)");
    }
    if let Some(code) = &filters.canonical_code {
        qb.push(" AND ")
            .push_bind(code.clone())
            .push(" = ANY(subjects_canonical)");
    }
    if let Some(agency) = &filters.agency {
        qb.push(" AND agency_id = ").push_bind(agency.clone());
    }
    if let Some(mode) = &filters.learning_mode {
        qb.push(" AND learning_mode = ").push_bind(mode.clone());
    }
    if let Some(tutor_type) = &filters.tutor_type {
        qb.push(" AND tutor_types @> jsonb_build_array(jsonb_build_object('type', ")
            .push_bind(tutor_type.clone())
            .push("::text))");
    }
    if let Some(min_rate) = filters.min_rate {
        qb.push(" AND COALESCE(rate_max, rate_min) >= ").push_bind(min_rate);
    }
    if let Some(location) = &filters.location_text {
        if let Ok(region) = location.parse::<Region>() {
            qb.push(" AND region = ").push_bind(region.to_string());
        } else {
            qb.push(" AND EXISTS (SELECT 1 FROM unnest(address || postal_code) loc WHERE loc ILIKE '%' || ")
                .push_bind(location.clone())
                .push(" || '%')");
        }
    }
}

/// Haversine distance key in metres as a SQL expression over bound origin
/// coordinates; rows without coordinates get [`NO_COORDS_KEY`].
fn push_distance_key(qb: &mut QueryBuilder<'_, Postgres>, lat: f64, lon: f64) {
    qb.push("COALESCE(CAST(ROUND(2 * 6371000 * asin(sqrt(pow(sin(radians(postal_lat - ")
        .push_bind(lat)
        .push(") / 2), 2) + cos(radians(")
        .push_bind(lat)
        .push(")) * cos(radians(postal_lat)) * pow(sin(radians(postal_lon - ")
        .push_bind(lon)
        .push(") / 2), 2)))) AS BIGINT), ")
        .push_bind(NO_COORDS_KEY)
        .push(")");
}

#[async_trait]
impl Store for PgStore {
    async fn insert_raw(&self, raw: NewRawMessage) -> Result<RawMessage, StoreError> {
        let row = sqlx::query(
            r"INSERT INTO raw_messages
                (channel, message_id, agency_id, text, published_at, edited_at, payload)
              VALUES ($1, $2, $3, $4, $5, $6, $7)
              ON CONFLICT (channel, message_id) DO UPDATE
                SET edited_at = COALESCE(EXCLUDED.edited_at, raw_messages.edited_at),
                    payload = EXCLUDED.payload
              RETURNING *",
        )
        .bind(&raw.channel)
        .bind(&raw.message_id)
        .bind(&raw.agency_id)
        .bind(&raw.text)
        .bind(raw.published_at)
        .bind(raw.edited_at)
        .bind(&raw.payload)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        raw_from_row(&row)
    }

    async fn get_raw(&self, raw_id: i64) -> Result<Option<RawMessage>, StoreError> {
        let row = sqlx::query("SELECT * FROM raw_messages WHERE id = $1")
            .bind(raw_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(raw_from_row).transpose()
    }

    async fn enqueue(
        &self,
        pipeline_version: &str,
        channel: &str,
        message_ids: &[String],
        force: bool,
    ) -> Result<u64, StoreError> {
        // One statement: insert a job per referenced raw row; on conflict
        // reset to pending unless the row is ok and force is off.
        let result = sqlx::query(
            r"INSERT INTO extraction_jobs (raw_id, pipeline_version, status, meta)
              SELECT r.id, $1, 'pending', '{}'::jsonb
                FROM raw_messages r
               WHERE r.channel = $2 AND r.message_id = ANY($3)
              ON CONFLICT (raw_id, pipeline_version) DO UPDATE
                SET status = 'pending',
                    error = NULL,
                    meta = extraction_jobs.meta
                           || jsonb_build_object('requeue_reason', 're-enqueued')
                           - 'not_before',
                    updated_at = now()
              WHERE extraction_jobs.status <> 'ok' OR $4",
        )
        .bind(pipeline_version)
        .bind(channel)
        .bind(message_ids)
        .bind(force)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn claim(
        &self,
        pipeline_version: &str,
        limit: usize,
    ) -> Result<Vec<ExtractionJob>, StoreError> {
        let rows = sqlx::query(
            r"WITH picked AS (
                SELECT id FROM extraction_jobs
                 WHERE pipeline_version = $1
                   AND status = 'pending'
                   AND (meta->>'not_before' IS NULL
                        OR (meta->>'not_before')::timestamptz <= now())
                 ORDER BY created_at, id
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
              )
              UPDATE extraction_jobs j
                 SET status = 'processing',
                     updated_at = now(),
                     meta = jsonb_set(
                         jsonb_set(
                             j.meta,
                             '{attempt}',
                             to_jsonb(COALESCE((j.meta->>'attempt')::int, 0) + 1)
                         ),
                         '{processing_started_at}',
                         to_jsonb(now())
                     )
                FROM picked
               WHERE j.id = picked.id
              RETURNING j.*",
        )
        .bind(pipeline_version)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let mut jobs: Vec<ExtractionJob> =
            rows.iter().map(job_from_row).collect::<Result<_, _>>()?;
        // RETURNING order is not guaranteed; restore claim order.
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r"UPDATE extraction_jobs
                 SET status = 'pending',
                     meta = meta || jsonb_build_object('requeue_reason', 'stale_requeue'),
                     updated_at = now()
               WHERE status = 'processing'
                 AND updated_at <= now() - make_interval(secs => $1)",
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn terminate(&self, job_id: i64, request: TerminateRequest) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query("SELECT * FROM extraction_jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::NotFound {
                entity: "extraction_job",
                key: job_id.to_string(),
            })?;
        let mut job = job_from_row(&row)?;
        if job.status != JobStatus::Processing && !request.supervisor {
            return Err(StoreError::InvalidTransition {
                job_id,
                from: job.status.to_string(),
                to: request.status.to_string(),
            });
        }
        job.meta.requeue_reason = request.requeue_reason;
        job.meta.not_before = request.not_before;
        if !request.assignment_ids.is_empty() {
            job.meta.assignment_ids = request.assignment_ids;
        }
        if let Some(err) = &request.error {
            job.meta.last_error_stage = Some(err.stage.clone());
        }
        sqlx::query(
            r"UPDATE extraction_jobs
                 SET status = $2, error = $3, meta = $4, llm_model = COALESCE($5, llm_model),
                     updated_at = now()
               WHERE id = $1",
        )
        .bind(job_id)
        .bind(job_status_str(request.status))
        .bind(request.error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(serde_json::to_value(&job.meta)?)
        .bind(request.llm_model)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn touch_job(&self, job_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE extraction_jobs SET updated_at = now() WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<ExtractionJob>, StoreError> {
        let row = sqlx::query("SELECT * FROM extraction_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn count_jobs(
        &self,
        pipeline_version: &str,
        status: JobStatus,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM extraction_jobs WHERE pipeline_version = $1 AND status = $2",
        )
        .bind(pipeline_version)
        .bind(job_status_str(status))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let n: i64 = row.try_get("n").map_err(db_err)?;
        Ok(n as u64)
    }

    async fn upsert_assignment(&self, draft: AssignmentDraft) -> Result<Assignment, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let inserted = sqlx::query(
            r"INSERT INTO assignments
                (agency_id, external_id, assignment_code, message_link,
                 academic_display_text, lesson_schedule, start_date,
                 time_availability_note, tutor_types, rate_raw_text,
                 rate_breakdown, learning_mode, address, postal_code,
                 postal_code_estimated, postal_lat, postal_lon,
                 postal_coords_estimated, region, nearest_mrt_computed,
                 nearest_mrt_computed_line, nearest_mrt_computed_distance_m,
                 rate_min, rate_max, signals_subjects, signals_levels,
                 signals_specific_student_levels, subjects_canonical,
                 subjects_general, canonicalization_version, published_at,
                 source_last_seen)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                      $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24,
                      $25, $26, $27, $28, $29, $30, $31,
                      COALESCE($32, $31))
              ON CONFLICT (agency_id, external_id) DO NOTHING
              RETURNING *",
        )
        .bind(&draft.agency_id)
        .bind(&draft.external_id)
        .bind(&draft.assignment_code)
        .bind(&draft.message_link)
        .bind(&draft.academic_display_text)
        .bind(&draft.lesson_schedule)
        .bind(&draft.start_date)
        .bind(&draft.time_availability_note)
        .bind(serde_json::to_value(&draft.tutor_types)?)
        .bind(&draft.rate_raw_text)
        .bind(&draft.rate_breakdown)
        .bind(&draft.learning_mode)
        .bind(&draft.address)
        .bind(&draft.postal_code)
        .bind(&draft.postal_code_estimated)
        .bind(draft.postal_lat)
        .bind(draft.postal_lon)
        .bind(draft.postal_coords_estimated)
        .bind(draft.region.map(|r| r.to_string()))
        .bind(&draft.nearest_mrt_computed)
        .bind(&draft.nearest_mrt_computed_line)
        .bind(draft.nearest_mrt_computed_distance_m)
        .bind(draft.rate_min)
        .bind(draft.rate_max)
        .bind(&draft.signals_subjects)
        .bind(&draft.signals_levels)
        .bind(&draft.signals_specific_student_levels)
        .bind(&draft.subjects_canonical)
        .bind(&draft.subjects_general)
        .bind(draft.canonicalization_version)
        .bind(draft.published_at)
        .bind(draft.source_last_seen)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(row) = inserted {
            let assignment = assignment_from_row(&row)?;
            tx.commit().await.map_err(db_err)?;
            return Ok(assignment);
        }

        // Conflict path: lock the row and run the shared merge policy.
        let row = sqlx::query(
            "SELECT * FROM assignments WHERE agency_id = $1 AND external_id = $2 FOR UPDATE",
        )
        .bind(&draft.agency_id)
        .bind(&draft.external_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let mut existing = assignment_from_row(&row)?;
        let effect = apply_merge(&mut existing, &draft, Utc::now());
        if effect.changed {
            update_assignment_row(&mut *tx, &existing).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(existing)
    }

    async fn get_assignment(&self, id: i64) -> Result<Option<Assignment>, StoreError> {
        let row = sqlx::query("SELECT * FROM assignments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(assignment_from_row).transpose()
    }

    async fn get_assignment_by_identity(
        &self,
        agency_id: &str,
        external_id: &str,
    ) -> Result<Option<Assignment>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM assignments WHERE agency_id = $1 AND external_id = $2",
        )
        .bind(agency_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(assignment_from_row).transpose()
    }

    async fn set_assignment_status(
        &self,
        id: i64,
        status: AssignmentStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE assignments SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(assignment_status_str(status))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "assignment",
                key: id.to_string(),
            });
        }
        Ok(())
    }

    async fn increment_clicks(
        &self,
        external_id: &str,
        original_url: Option<&str>,
        delta: i64,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(
            r"INSERT INTO assignment_clicks (external_id, click_count, original_url, updated_at)
              VALUES ($1, GREATEST(0, $2), $3, now())
              ON CONFLICT (external_id) DO UPDATE
                SET click_count = assignment_clicks.click_count + GREATEST(0, $2),
                    original_url = COALESCE($3, assignment_clicks.original_url),
                    updated_at = now()
              RETURNING click_count",
        )
        .bind(external_id)
        .bind(delta)
        .bind(original_url)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let count: i64 = row.try_get("click_count").map_err(db_err)?;
        sqlx::query("UPDATE broadcast_messages SET updated_at = now() WHERE external_id = $1")
            .bind(external_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(count)
    }

    async fn get_clicks(&self, external_id: &str) -> Result<Option<ClickRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM assignment_clicks WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|row| {
            Ok(ClickRecord {
                external_id: row.try_get("external_id").map_err(db_err)?,
                click_count: row.try_get("click_count").map_err(db_err)?,
                original_url: row.try_get("original_url").map_err(db_err)?,
                updated_at: row.try_get("updated_at").map_err(db_err)?,
            })
        })
        .transpose()
    }

    async fn record_broadcast(&self, record: BroadcastRecord) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO broadcast_messages (external_id, channel, message_id, content, updated_at)
              VALUES ($1, $2, $3, $4, now())
              ON CONFLICT (external_id) DO UPDATE
                SET channel = EXCLUDED.channel,
                    message_id = EXCLUDED.message_id,
                    content = EXCLUDED.content,
                    updated_at = now()",
        )
        .bind(&record.external_id)
        .bind(&record.channel)
        .bind(&record.message_id)
        .bind(&record.content)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_broadcast(
        &self,
        external_id: &str,
    ) -> Result<Option<BroadcastRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM broadcast_messages WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|row| {
            Ok(BroadcastRecord {
                external_id: row.try_get("external_id").map_err(db_err)?,
                channel: row.try_get("channel").map_err(db_err)?,
                message_id: row.try_get("message_id").map_err(db_err)?,
                content: row.try_get("content").map_err(db_err)?,
                updated_at: row.try_get("updated_at").map_err(db_err)?,
            })
        })
        .transpose()
    }

    async fn dedup_candidates(
        &self,
        assignment: &Assignment,
        window_days: i64,
        limit: usize,
    ) -> Result<Vec<Assignment>, StoreError> {
        let rows = sqlx::query(
            r"SELECT * FROM assignments
               WHERE id <> $1
                 AND status = 'open'
                 AND agency_id <> $2
                 AND published_at >= now() - make_interval(days => $3)
               ORDER BY published_at DESC, id
               LIMIT $4",
        )
        .bind(assignment.id)
        .bind(&assignment.agency_id)
        .bind(window_days as i32)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(assignment_from_row).collect()
    }

    async fn get_group(&self, group_id: i64) -> Result<Option<DuplicateGroup>, StoreError> {
        let row = sqlx::query("SELECT * FROM duplicate_groups WHERE id = $1")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(group_from_row).transpose()
    }

    async fn group_members(&self, group_id: i64) -> Result<Vec<Assignment>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM assignments WHERE duplicate_group_id = $1 ORDER BY id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(assignment_from_row).collect()
    }

    async fn create_group(
        &self,
        members: &[(i64, f64)],
        algorithm_version: i32,
    ) -> Result<DuplicateGroup, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let avg = if members.is_empty() {
            0.0
        } else {
            members.iter().map(|(_, s)| *s).sum::<f64>() / members.len() as f64
        };
        let row = sqlx::query(
            r"INSERT INTO duplicate_groups
                (member_count, avg_confidence_score, detection_algorithm_version)
              VALUES ($1, $2, $3)
              RETURNING *",
        )
        .bind(members.len() as i32)
        .bind(avg)
        .bind(algorithm_version)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let group_id: i64 = row.try_get("id").map_err(db_err)?;
        for (id, score) in members {
            let updated = sqlx::query(
                r"UPDATE assignments
                     SET duplicate_group_id = $2, duplicate_confidence_score = $3
                   WHERE id = $1",
            )
            .bind(id)
            .bind(group_id)
            .bind(score)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            if updated.rows_affected() == 0 {
                return Err(StoreError::NotFound {
                    entity: "assignment",
                    key: id.to_string(),
                });
            }
        }
        let group = recompute_primary_tx(&mut tx, group_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(group)
    }

    async fn link_to_group(
        &self,
        group_id: i64,
        assignment_id: i64,
        score: f64,
    ) -> Result<DuplicateGroup, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        lock_groups_tx(&mut tx, &[group_id]).await?;
        let updated = sqlx::query(
            r"UPDATE assignments
                 SET duplicate_group_id = $2, duplicate_confidence_score = $3
               WHERE id = $1",
        )
        .bind(assignment_id)
        .bind(group_id)
        .bind(score)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "assignment",
                key: assignment_id.to_string(),
            });
        }
        refresh_group_confidence_tx(&mut tx, group_id).await?;
        let group = recompute_primary_tx(&mut tx, group_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(group)
    }

    async fn merge_groups(
        &self,
        group_ids: &[i64],
        new_member: (i64, f64),
        algorithm_version: i32,
    ) -> Result<DuplicateGroup, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut sorted: Vec<i64> = group_ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let groups = lock_groups_tx(&mut tx, &sorted).await?;
        let target = groups
            .iter()
            .min_by_key(|g| (g.created_at, g.id))
            .map(|g| g.id)
            .ok_or(StoreError::NotFound {
                entity: "duplicate_group",
                key: format!("{group_ids:?}"),
            })?;

        sqlx::query(
            "UPDATE assignments SET duplicate_group_id = $1 WHERE duplicate_group_id = ANY($2)",
        )
        .bind(target)
        .bind(&sorted)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query(
            r"UPDATE assignments
                 SET duplicate_group_id = $2, duplicate_confidence_score = $3
               WHERE id = $1",
        )
        .bind(new_member.0)
        .bind(target)
        .bind(new_member.1)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query(
            r"UPDATE duplicate_groups
                 SET status = 'resolved', member_count = 0,
                     primary_assignment_id = NULL, updated_at = now()
               WHERE id = ANY($1) AND id <> $2",
        )
        .bind(&sorted)
        .bind(target)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query(
            "UPDATE duplicate_groups SET detection_algorithm_version = $2 WHERE id = $1",
        )
        .bind(target)
        .bind(algorithm_version)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        refresh_group_confidence_tx(&mut tx, target).await?;
        let group = recompute_primary_tx(&mut tx, target).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(group)
    }

    async fn promote_next_primary(&self, group_id: i64) -> Result<Option<i64>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        lock_groups_tx(&mut tx, &[group_id]).await?;
        let group = recompute_primary_tx(&mut tx, group_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(group.primary_assignment_id)
    }

    async fn open_assignments_after(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<Assignment>, StoreError> {
        let rows = sqlx::query(
            r"SELECT * FROM assignments
               WHERE id > $1 AND status = 'open'
               ORDER BY id
               LIMIT $2",
        )
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(assignment_from_row).collect()
    }

    async fn set_freshness_tiers(
        &self,
        updates: &[(i64, FreshnessTier)],
    ) -> Result<u64, StoreError> {
        let mut changed = 0u64;
        for (id, tier) in updates {
            let result = sqlx::query(
                "UPDATE assignments SET freshness_tier = $2 WHERE id = $1 AND freshness_tier <> $2",
            )
            .bind(id)
            .bind(tier_str(*tier))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            changed += result.rows_affected();
        }
        Ok(changed)
    }

    async fn list_open(&self, query: ListQuery) -> Result<Page, StoreError> {
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

        // Total under the filters, cursor-independent.
        let mut count_qb =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS n FROM assignments WHERE status = 'open'");
        push_filters(&mut count_qb, &query.filters);
        let count_row = count_qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let total_count: i64 = count_row.try_get("n").map_err(db_err)?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT q.* FROM (SELECT a.*, ");
        match (query.sort, query.origin) {
            (SortOrder::Distance, Some((lat, lon))) => push_distance_key(&mut qb, lat, lon),
            (SortOrder::Distance, None) => {
                qb.push_bind(NO_COORDS_KEY);
            }
            (SortOrder::Newest, _) => {
                qb.push_bind(0i64);
            }
        }
        qb.push(" AS distance_key_m FROM assignments a WHERE a.status = 'open'");
        push_filters(&mut qb, &query.filters);
        qb.push(") q WHERE TRUE");

        match (query.sort, cursor) {
            (SortOrder::Newest, Some(Cursor::Newest { sort_ts_micros, id })) => {
                let ts = DateTime::<Utc>::from_timestamp_micros(sort_ts_micros)
                    .ok_or_else(|| StoreError::InvalidCursor("timestamp out of range".into()))?;
                qb.push(" AND (COALESCE(q.published_at, q.created_at) < ")
                    .push_bind(ts)
                    .push(" OR (COALESCE(q.published_at, q.created_at) = ")
                    .push_bind(ts)
                    .push(" AND q.id < ")
                    .push_bind(id)
                    .push("))");
            }
            (
                SortOrder::Distance,
                Some(Cursor::Distance {
                    distance_key_m,
                    last_seen_micros,
                    id,
                }),
            ) => {
                let ls = DateTime::<Utc>::from_timestamp_micros(last_seen_micros)
                    .ok_or_else(|| StoreError::InvalidCursor("timestamp out of range".into()))?;
                qb.push(" AND (q.distance_key_m > ")
                    .push_bind(distance_key_m)
                    .push(" OR (q.distance_key_m = ")
                    .push_bind(distance_key_m)
                    .push(" AND q.last_seen < ")
                    .push_bind(ls)
                    .push(") OR (q.distance_key_m = ")
                    .push_bind(distance_key_m)
                    .push(" AND q.last_seen = ")
                    .push_bind(ls)
                    .push(" AND q.id < ")
                    .push_bind(id)
                    .push("))");
            }
            _ => {}
        }

        match query.sort {
            SortOrder::Newest => {
                qb.push(" ORDER BY COALESCE(q.published_at, q.created_at) DESC, q.id DESC");
            }
            SortOrder::Distance => {
                qb.push(" ORDER BY q.distance_key_m ASC, q.last_seen DESC, q.id DESC");
            }
        }
        qb.push(" LIMIT ").push_bind((limit + 1) as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        let has_more = rows.len() > limit;

        let mut listed = Vec::with_capacity(limit.min(rows.len()));
        let mut last_key: Option<(i64, DateTime<Utc>, i64)> = None;
        for row in rows.iter().take(limit) {
            let assignment = assignment_from_row(row)?;
            let key: i64 = row.try_get("distance_key_m").map_err(db_err)?;
            let distance_km = if key == NO_COORDS_KEY || query.sort == SortOrder::Newest {
                None
            } else {
                Some(key as f64 / 1000.0)
            };
            last_key = Some((key, assignment.last_seen, assignment.id));
            listed.push((assignment, distance_km));
        }

        let next_cursor = if has_more {
            last_key.map(|(key, last_seen, id)| match query.sort {
                SortOrder::Newest => {
                    let sort_ts = listed
                        .last()
                        .map(|(a, _)| a.sort_ts())
                        .unwrap_or(last_seen);
                    Cursor::Newest {
                        sort_ts_micros: sort_ts.timestamp_micros(),
                        id,
                    }
                    .encode()
                }
                SortOrder::Distance => Cursor::Distance {
                    distance_key_m: key,
                    last_seen_micros: last_seen.timestamp_micros(),
                    id,
                }
                .encode(),
            })
        } else {
            None
        };

        Ok(Page {
            rows: listed
                .into_iter()
                .map(|(assignment, distance_km)| ListedAssignment {
                    assignment,
                    distance_km,
                })
                .collect(),
            total_count: total_count as u64,
            next_cursor,
        })
    }

    async fn facets(&self, filters: ListFilters) -> Result<Facets, StoreError> {
        async fn counts(
            pool: &PgPool,
            base: &str,
            filters: &ListFilters,
        ) -> Result<Vec<(String, u64)>, StoreError> {
            let mut qb = QueryBuilder::<Postgres>::new(base);
            push_filters(&mut qb, filters);
            qb.push(" GROUP BY 1 ORDER BY 2 DESC, 1");
            let rows = qb.build().fetch_all(pool).await.map_err(db_err)?;
            rows.iter()
                .map(|row| {
                    let k: String = row.try_get("k").map_err(db_err)?;
                    let n: i64 = row.try_get("n").map_err(db_err)?;
                    Ok((k, n as u64))
                })
                .collect()
        }

        let agencies = counts(
            &self.pool,
            "SELECT agency_id AS k, COUNT(*) AS n FROM assignments WHERE status = 'open'",
            &filters,
        )
        .await?;
        let regions = counts(
            &self.pool,
            "SELECT region AS k, COUNT(*) AS n FROM assignments WHERE status = 'open' AND region IS NOT NULL",
            &filters,
        )
        .await?;
        let levels = counts(
            &self.pool,
            "SELECT l AS k, COUNT(*) AS n FROM assignments, unnest(signals_levels) l WHERE status = 'open'",
            &filters,
        )
        .await?;
        let subjects_general = counts(
            &self.pool,
            "SELECT g AS k, COUNT(*) AS n FROM assignments, unnest(subjects_general) g WHERE status = 'open'",
            &filters,
        )
        .await?;

        Ok(Facets {
            agencies,
            regions,
            levels,
            subjects_general,
        })
    }

    async fn upsert_tutor(&self, profile: TutorProfile) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO tutor_profiles
                (id, chat_id, subjects, levels, home_lat, home_lon,
                 max_distance_km, rating_threshold_percentile, active)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
              ON CONFLICT (id) DO UPDATE
                SET chat_id = EXCLUDED.chat_id,
                    subjects = EXCLUDED.subjects,
                    levels = EXCLUDED.levels,
                    home_lat = EXCLUDED.home_lat,
                    home_lon = EXCLUDED.home_lon,
                    max_distance_km = EXCLUDED.max_distance_km,
                    rating_threshold_percentile = EXCLUDED.rating_threshold_percentile,
                    active = EXCLUDED.active",
        )
        .bind(profile.id)
        .bind(&profile.chat_id)
        .bind(&profile.subjects)
        .bind(&profile.levels)
        .bind(profile.home_lat)
        .bind(profile.home_lon)
        .bind(profile.max_distance_km)
        .bind(profile.rating_threshold_percentile)
        .bind(profile.active)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn active_tutors(&self) -> Result<Vec<TutorProfile>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tutor_profiles WHERE active ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(tutor_from_row).collect()
    }

    async fn record_rating(&self, rating: TutorRating) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO tutor_ratings
                (tutor_id, assignment_id, rating, distance_km_at_send, created_at)
              VALUES ($1, $2, $3, $4, $5)
              ON CONFLICT (tutor_id, assignment_id) DO UPDATE
                SET rating = EXCLUDED.rating",
        )
        .bind(rating.tutor_id)
        .bind(rating.assignment_id)
        .bind(rating.rating)
        .bind(rating.distance_km_at_send)
        .bind(rating.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn tutor_rating_threshold(
        &self,
        tutor_id: i64,
        percentile: f64,
    ) -> Result<Option<f64>, StoreError> {
        let row = sqlx::query(
            r"SELECT percentile_disc($2) WITHIN GROUP (ORDER BY rating) AS threshold
                FROM tutor_ratings WHERE tutor_id = $1",
        )
        .bind(tutor_id)
        .bind(percentile.clamp(0.0, 100.0) / 100.0)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let threshold: Option<f64> = row.try_get("threshold").map_err(db_err)?;
        Ok(threshold)
    }

    async fn tutor_avg_rate(&self, tutor_id: i64) -> Result<Option<f64>, StoreError> {
        let row = sqlx::query(
            r"SELECT AVG((COALESCE(a.rate_min, a.rate_max) + COALESCE(a.rate_max, a.rate_min)) / 2.0) AS avg_rate
                FROM tutor_ratings r
                JOIN assignments a ON a.id = r.assignment_id
               WHERE r.tutor_id = $1
                 AND COALESCE(a.rate_min, a.rate_max) IS NOT NULL",
        )
        .bind(tutor_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let avg: Option<f64> = row.try_get("avg_rate").map_err(db_err)?;
        Ok(avg)
    }

    async fn mark_dm_sent(&self, tutor_id: i64, assignment_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"INSERT INTO dm_log (tutor_id, assignment_id)
              VALUES ($1, $2)
              ON CONFLICT (tutor_id, assignment_id) DO NOTHING",
        )
        .bind(tutor_id)
        .bind(assignment_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }
}

/// Lock groups in ascending id order; returns the locked rows.
async fn lock_groups_tx(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    group_ids: &[i64],
) -> Result<Vec<DuplicateGroup>, StoreError> {
    let rows = sqlx::query(
        "SELECT * FROM duplicate_groups WHERE id = ANY($1) ORDER BY id FOR UPDATE",
    )
    .bind(group_ids)
    .fetch_all(&mut **tx)
    .await
    .map_err(db_err)?;
    if rows.len() != group_ids.len() {
        return Err(StoreError::NotFound {
            entity: "duplicate_group",
            key: format!("{group_ids:?}"),
        });
    }
    rows.iter().map(group_from_row).collect()
}

/// Re-elect the primary among open members inside the caller's transaction:
/// `published_at asc` (falling back to `created_at`), then `id asc`. Exactly
/// one member ends up primary; a group with no open members resolves.
async fn recompute_primary_tx(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    group_id: i64,
) -> Result<DuplicateGroup, StoreError> {
    let winner_row = sqlx::query(
        r"SELECT id FROM assignments
           WHERE duplicate_group_id = $1 AND status = 'open'
           ORDER BY COALESCE(published_at, created_at), id
           LIMIT 1",
    )
    .bind(group_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)?;
    let winner: Option<i64> = winner_row
        .map(|row| row.try_get("id").map_err(db_err))
        .transpose()?;

    sqlx::query(
        "UPDATE assignments SET is_primary_in_group = (id = $2) WHERE duplicate_group_id = $1",
    )
    .bind(group_id)
    .bind(winner)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    let row = sqlx::query(
        r"UPDATE duplicate_groups
             SET primary_assignment_id = $2,
                 member_count = (SELECT COUNT(*) FROM assignments WHERE duplicate_group_id = $1),
                 status = CASE WHEN $2 IS NULL THEN 'resolved' ELSE status END,
                 updated_at = now()
           WHERE id = $1
          RETURNING *",
    )
    .bind(group_id)
    .bind(winner)
    .fetch_one(&mut **tx)
    .await
    .map_err(db_err)?;
    group_from_row(&row)
}

/// Recompute the rolling average confidence from member scores.
async fn refresh_group_confidence_tx(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    group_id: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        r"UPDATE duplicate_groups g
             SET avg_confidence_score = COALESCE(
                 (SELECT AVG(duplicate_confidence_score) FROM assignments
                   WHERE duplicate_group_id = g.id
                     AND duplicate_confidence_score IS NOT NULL),
                 g.avg_confidence_score)
           WHERE g.id = $1",
    )
    .bind(group_id)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}
