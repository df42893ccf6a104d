//! The upsert merge policy, shared by both store adapters
//!
//! Conflict key is `(agency_id, external_id)`. Per-field rules:
//! identity/provenance fields are set-once; display/location/numeric
//! fields overwrite with the new value when non-empty; arrays are replaced
//! (never unioned) when the incoming array is non-empty; `bump_count`
//! increments when the source publish/edit time advanced; first-seen
//! timestamps are preserved. `last_seen` only advances when the merge
//! actually changed something or the source advanced, which is what makes
//! re-upserting an identical draft a no-op.

use chrono::{DateTime, Utc};

use tutorflow_model::{Assignment, AssignmentDraft};

/// Result of one merge application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeEffect {
    /// Whether any stored field changed.
    pub changed: bool,
    /// Whether this upsert counted as a bump.
    pub bumped: bool,
}

fn set_once<T: Clone + PartialEq>(slot: &mut Option<T>, incoming: &Option<T>, changed: &mut bool) {
    if slot.is_none()
        && let Some(value) = incoming
    {
        *slot = Some(value.clone());
        *changed = true;
    }
}

fn overwrite_nonempty_str(slot: &mut Option<String>, incoming: &Option<String>, changed: &mut bool) {
    if let Some(value) = incoming
        && !value.trim().is_empty()
        && slot.as_deref() != Some(value.as_str())
    {
        *slot = Some(value.clone());
        *changed = true;
    }
}

fn overwrite_some<T: Clone + PartialEq>(slot: &mut Option<T>, incoming: &Option<T>, changed: &mut bool) {
    if let Some(value) = incoming
        && slot.as_ref() != Some(value)
    {
        *slot = Some(value.clone());
        *changed = true;
    }
}

fn replace_nonempty<T: Clone + PartialEq>(slot: &mut Vec<T>, incoming: &[T], changed: &mut bool) {
    if !incoming.is_empty() && slot.as_slice() != incoming {
        *slot = incoming.to_vec();
        *changed = true;
    }
}

/// Apply the merge policy for `draft` onto `existing` in place.
///
/// `now` stamps `last_seen` when the merge had an effect. Duplicate-group
/// fields, lifecycle status, and freshness tier are never touched here.
pub fn apply_merge(
    existing: &mut Assignment,
    draft: &AssignmentDraft,
    now: DateTime<Utc>,
) -> MergeEffect {
    let mut changed = false;

    // Set-once identity & provenance
    set_once(&mut existing.assignment_code, &draft.assignment_code, &mut changed);
    set_once(&mut existing.message_link, &draft.message_link, &mut changed);
    if existing.published_at.is_none()
        && let Some(published) = draft.published_at
    {
        existing.published_at = Some(published);
        changed = true;
    }

    // Display
    overwrite_nonempty_str(
        &mut existing.academic_display_text,
        &draft.academic_display_text,
        &mut changed,
    );
    overwrite_nonempty_str(&mut existing.start_date, &draft.start_date, &mut changed);
    overwrite_nonempty_str(
        &mut existing.time_availability_note,
        &draft.time_availability_note,
        &mut changed,
    );
    overwrite_nonempty_str(&mut existing.rate_raw_text, &draft.rate_raw_text, &mut changed);
    overwrite_nonempty_str(&mut existing.rate_breakdown, &draft.rate_breakdown, &mut changed);
    overwrite_nonempty_str(&mut existing.learning_mode, &draft.learning_mode, &mut changed);
    replace_nonempty(&mut existing.lesson_schedule, &draft.lesson_schedule, &mut changed);
    replace_nonempty(&mut existing.tutor_types, &draft.tutor_types, &mut changed);

    // Location
    replace_nonempty(&mut existing.address, &draft.address, &mut changed);
    replace_nonempty(&mut existing.postal_code, &draft.postal_code, &mut changed);
    replace_nonempty(
        &mut existing.postal_code_estimated,
        &draft.postal_code_estimated,
        &mut changed,
    );
    overwrite_some(&mut existing.postal_lat, &draft.postal_lat, &mut changed);
    overwrite_some(&mut existing.postal_lon, &draft.postal_lon, &mut changed);
    if draft.postal_lat.is_some()
        && existing.postal_coords_estimated != draft.postal_coords_estimated
    {
        existing.postal_coords_estimated = draft.postal_coords_estimated;
        changed = true;
    }
    overwrite_some(&mut existing.region, &draft.region, &mut changed);
    overwrite_nonempty_str(
        &mut existing.nearest_mrt_computed,
        &draft.nearest_mrt_computed,
        &mut changed,
    );
    overwrite_nonempty_str(
        &mut existing.nearest_mrt_computed_line,
        &draft.nearest_mrt_computed_line,
        &mut changed,
    );
    overwrite_some(
        &mut existing.nearest_mrt_computed_distance_m,
        &draft.nearest_mrt_computed_distance_m,
        &mut changed,
    );

    // Numeric
    overwrite_some(&mut existing.rate_min, &draft.rate_min, &mut changed);
    overwrite_some(&mut existing.rate_max, &draft.rate_max, &mut changed);

    // Signals & canonicalization
    replace_nonempty(&mut existing.signals_subjects, &draft.signals_subjects, &mut changed);
    replace_nonempty(&mut existing.signals_levels, &draft.signals_levels, &mut changed);
    replace_nonempty(
        &mut existing.signals_specific_student_levels,
        &draft.signals_specific_student_levels,
        &mut changed,
    );
    replace_nonempty(
        &mut existing.subjects_canonical,
        &draft.subjects_canonical,
        &mut changed,
    );
    replace_nonempty(&mut existing.subjects_general, &draft.subjects_general, &mut changed);
    // Monotonic across reprocessings
    if draft.canonicalization_version > existing.canonicalization_version {
        existing.canonicalization_version = draft.canonicalization_version;
        changed = true;
    }

    // Bump detection: the source publish/edit time advanced
    let mut bumped = false;
    if let Some(incoming_seen) = draft.source_last_seen {
        let advanced = existing
            .source_last_seen
            .is_none_or(|prev| incoming_seen > prev);
        if advanced {
            if existing.source_last_seen.is_some() {
                existing.bump_count += 1;
                bumped = true;
            }
            existing.source_last_seen = Some(incoming_seen);
            changed = true;
        }
    }

    if changed {
        existing.last_seen = now;
        // published_at <= source_last_seen <= last_seen
        if let (Some(published), Some(seen)) = (existing.published_at, existing.source_last_seen)
            && seen < published
        {
            existing.source_last_seen = Some(published);
        }
    }

    MergeEffect { changed, bumped }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tutorflow_model::{AssignmentStatus, FreshnessTier};

    fn ts(s: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(s, 0).unwrap()
    }

    fn draft() -> AssignmentDraft {
        AssignmentDraft {
            agency_id: "acme".into(),
            external_id: "a-1".into(),
            assignment_code: Some("TA-1".into()),
            message_link: Some("https://t.me/acme/100".into()),
            academic_display_text: Some("Sec 3 Math".into()),
            lesson_schedule: vec!["Mon 7-9pm".into()],
            start_date: None,
            time_availability_note: Some("Mon 7-9pm".into()),
            tutor_types: vec![],
            rate_raw_text: Some("$40/hr".into()),
            rate_breakdown: None,
            learning_mode: None,
            address: vec!["Tampines".into()],
            postal_code: vec!["520123".into()],
            postal_code_estimated: vec![],
            postal_lat: Some(1.3530),
            postal_lon: Some(103.9440),
            postal_coords_estimated: false,
            region: None,
            nearest_mrt_computed: Some("Tampines".into()),
            nearest_mrt_computed_line: Some("EW".into()),
            nearest_mrt_computed_distance_m: Some(400),
            rate_min: Some(40),
            rate_max: Some(40),
            signals_subjects: vec!["Math".into()],
            signals_levels: vec!["Secondary".into()],
            signals_specific_student_levels: vec!["Sec 3".into()],
            subjects_canonical: vec!["MATH.SEC_EMATH".into()],
            subjects_general: vec!["MATH".into()],
            canonicalization_version: 3,
            published_at: Some(ts(1_000)),
            source_last_seen: Some(ts(1_000)),
        }
    }

    fn assignment_from(d: &AssignmentDraft, now: DateTime<Utc>) -> Assignment {
        Assignment {
            id: 1,
            agency_id: d.agency_id.clone(),
            external_id: d.external_id.clone(),
            assignment_code: d.assignment_code.clone(),
            message_link: d.message_link.clone(),
            academic_display_text: d.academic_display_text.clone(),
            lesson_schedule: d.lesson_schedule.clone(),
            start_date: d.start_date.clone(),
            time_availability_note: d.time_availability_note.clone(),
            tutor_types: d.tutor_types.clone(),
            rate_raw_text: d.rate_raw_text.clone(),
            rate_breakdown: d.rate_breakdown.clone(),
            learning_mode: d.learning_mode.clone(),
            address: d.address.clone(),
            postal_code: d.postal_code.clone(),
            postal_code_estimated: d.postal_code_estimated.clone(),
            postal_lat: d.postal_lat,
            postal_lon: d.postal_lon,
            postal_coords_estimated: d.postal_coords_estimated,
            region: d.region,
            nearest_mrt_computed: d.nearest_mrt_computed.clone(),
            nearest_mrt_computed_line: d.nearest_mrt_computed_line.clone(),
            nearest_mrt_computed_distance_m: d.nearest_mrt_computed_distance_m,
            rate_min: d.rate_min,
            rate_max: d.rate_max,
            signals_subjects: d.signals_subjects.clone(),
            signals_levels: d.signals_levels.clone(),
            signals_specific_student_levels: d.signals_specific_student_levels.clone(),
            subjects_canonical: d.subjects_canonical.clone(),
            subjects_general: d.subjects_general.clone(),
            canonicalization_version: d.canonicalization_version,
            created_at: now,
            published_at: d.published_at,
            source_last_seen: d.source_last_seen,
            last_seen: now,
            status: AssignmentStatus::Open,
            freshness_tier: FreshnessTier::Green,
            bump_count: 0,
            duplicate_group_id: None,
            is_primary_in_group: true,
            duplicate_confidence_score: None,
        }
    }

    #[test]
    fn test_identical_reupsert_is_noop() {
        let d = draft();
        let mut row = assignment_from(&d, ts(2_000));
        let before = row.clone();
        let effect = apply_merge(&mut row, &d, ts(3_000));
        assert!(!effect.changed);
        assert!(!effect.bumped);
        assert_eq!(row, before, "identical draft must not mutate the row");
    }

    #[test]
    fn test_bump_on_source_advance() {
        let d = draft();
        let mut row = assignment_from(&d, ts(2_000));
        let mut bumped = draft();
        bumped.source_last_seen = Some(ts(5_000));
        let effect = apply_merge(&mut row, &bumped, ts(6_000));
        assert!(effect.bumped);
        assert_eq!(row.bump_count, 1);
        assert_eq!(row.source_last_seen, Some(ts(5_000)));
        assert_eq!(row.last_seen, ts(6_000));
    }

    #[test]
    fn test_set_once_fields_survive() {
        let d = draft();
        let mut row = assignment_from(&d, ts(2_000));
        let mut second = draft();
        second.assignment_code = Some("TA-OTHER".into());
        second.published_at = Some(ts(9_000));
        apply_merge(&mut row, &second, ts(9_500));
        assert_eq!(row.assignment_code.as_deref(), Some("TA-1"));
        assert_eq!(row.published_at, Some(ts(1_000)));
    }

    #[test]
    fn test_arrays_replaced_not_unioned() {
        let d = draft();
        let mut row = assignment_from(&d, ts(2_000));
        let mut second = draft();
        second.postal_code = vec!["530111".into()];
        second.source_last_seen = Some(ts(4_000));
        apply_merge(&mut row, &second, ts(4_500));
        assert_eq!(row.postal_code, vec!["530111"]);
    }

    #[test]
    fn test_empty_incoming_arrays_preserve_existing() {
        let d = draft();
        let mut row = assignment_from(&d, ts(2_000));
        let mut second = draft();
        second.postal_code = vec![];
        second.signals_subjects = vec![];
        apply_merge(&mut row, &second, ts(4_500));
        assert_eq!(row.postal_code, vec!["520123"]);
        assert_eq!(row.signals_subjects, vec!["Math"]);
    }

    #[test]
    fn test_canonicalization_version_monotonic() {
        let d = draft();
        let mut row = assignment_from(&d, ts(2_000));
        let mut older = draft();
        older.canonicalization_version = 1;
        apply_merge(&mut row, &older, ts(4_000));
        assert_eq!(row.canonicalization_version, 3);
        let mut newer = draft();
        newer.canonicalization_version = 4;
        apply_merge(&mut row, &newer, ts(5_000));
        assert_eq!(row.canonicalization_version, 4);
    }

    #[test]
    fn test_first_seen_created_at_untouched() {
        let d = draft();
        let mut row = assignment_from(&d, ts(2_000));
        let mut second = draft();
        second.source_last_seen = Some(ts(9_000));
        apply_merge(&mut row, &second, ts(9_100));
        assert_eq!(row.created_at, ts(2_000));
    }
}
