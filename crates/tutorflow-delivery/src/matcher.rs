//! Tutor-to-assignment matching: subject ∩ level ∩ location radius

use tutorflow_enrich::haversine_km;
use tutorflow_model::{Assignment, TutorProfile};

/// Match decision for one tutor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    /// Distance from the tutor's home, when both ends have coordinates.
    pub distance_km: Option<f64>,
}

/// Whether the tutor's profile matches the assignment.
///
/// Subject: any profile subject appears in the assignment's canonical,
/// general, or signal subjects (case-insensitive). Level: any profile level
/// appears in the assignment's level signals. Location: within the tutor's
/// radius (falling back to `default_max_km`); assignments or tutors without
/// coordinates pass the location gate, a missing postal code is not a
/// reason to hide work.
#[must_use]
pub fn tutor_matches(
    profile: &TutorProfile,
    assignment: &Assignment,
    default_max_km: f64,
) -> Option<MatchResult> {
    if profile.subjects.is_empty() || !subject_overlap(profile, assignment) {
        return None;
    }
    if !profile.levels.is_empty() && !level_overlap(profile, assignment) {
        return None;
    }

    let distance_km = match (
        profile.home_lat,
        profile.home_lon,
        assignment.postal_lat,
        assignment.postal_lon,
    ) {
        (Some(tlat), Some(tlon), Some(alat), Some(alon)) => {
            let km = haversine_km(tlat, tlon, alat, alon);
            let max = profile.max_distance_km.unwrap_or(default_max_km);
            if km > max {
                return None;
            }
            Some(km)
        }
        _ => None,
    };

    Some(MatchResult { distance_km })
}

fn subject_overlap(profile: &TutorProfile, assignment: &Assignment) -> bool {
    profile.subjects.iter().any(|s| {
        assignment
            .subjects_canonical
            .iter()
            .chain(assignment.subjects_general.iter())
            .chain(assignment.signals_subjects.iter())
            .any(|x| x.eq_ignore_ascii_case(s))
    })
}

fn level_overlap(profile: &TutorProfile, assignment: &Assignment) -> bool {
    profile.levels.iter().any(|l| {
        assignment
            .signals_levels
            .iter()
            .chain(assignment.signals_specific_student_levels.iter())
            .any(|x| x.eq_ignore_ascii_case(l))
    })
}

/// Deterministic rating predictor feeding the adaptive threshold gate.
///
/// Base 4.0, +0.5 when the assignment pays at least the tutor's historical
/// average, −0.5 per 4 km of distance (capped at −2.5). The scale matches
/// the 1–5 rating domain.
#[must_use]
pub fn predict_rating(distance_km: Option<f64>, pays_at_least_average: bool) -> f64 {
    let mut predicted = 4.0;
    if pays_at_least_average {
        predicted += 0.5;
    }
    if let Some(km) = distance_km {
        predicted -= (km / 4.0 * 0.5).min(2.5);
    }
    predicted.clamp(1.0, 5.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tutorflow_model::{AssignmentStatus, FreshnessTier};

    fn assignment() -> Assignment {
        Assignment {
            id: 1,
            agency_id: "acme".into(),
            external_id: "a-1".into(),
            assignment_code: None,
            message_link: None,
            academic_display_text: Some("Sec 3 Math".into()),
            lesson_schedule: vec![],
            start_date: None,
            time_availability_note: None,
            tutor_types: vec![],
            rate_raw_text: None,
            rate_breakdown: None,
            learning_mode: None,
            address: vec![],
            postal_code: vec!["520123".into()],
            postal_code_estimated: vec![],
            postal_lat: Some(1.3530),
            postal_lon: Some(103.9440),
            postal_coords_estimated: false,
            region: None,
            nearest_mrt_computed: None,
            nearest_mrt_computed_line: None,
            nearest_mrt_computed_distance_m: None,
            rate_min: Some(40),
            rate_max: Some(40),
            signals_subjects: vec!["Math".into()],
            signals_levels: vec!["Secondary".into()],
            signals_specific_student_levels: vec!["Sec 3".into()],
            subjects_canonical: vec!["MATH.SEC_EMATH".into()],
            subjects_general: vec!["MATH".into()],
            canonicalization_version: 3,
            created_at: Utc::now(),
            published_at: Some(Utc::now()),
            source_last_seen: None,
            last_seen: Utc::now(),
            status: AssignmentStatus::Open,
            freshness_tier: FreshnessTier::Green,
            bump_count: 0,
            duplicate_group_id: None,
            is_primary_in_group: true,
            duplicate_confidence_score: None,
        }
    }

    fn tutor() -> TutorProfile {
        TutorProfile {
            id: 1,
            chat_id: "chat-1".into(),
            subjects: vec!["MATH.SEC_EMATH".into()],
            levels: vec!["Secondary".into()],
            home_lat: Some(1.3536),
            home_lon: Some(103.9452),
            max_distance_km: Some(10.0),
            rating_threshold_percentile: None,
            active: true,
        }
    }

    #[test]
    fn test_full_match_with_distance() {
        let result = tutor_matches(&tutor(), &assignment(), 12.0).unwrap();
        let km = result.distance_km.unwrap();
        assert!(km < 1.0, "same-town distance, got {km}");
    }

    #[test]
    fn test_subject_mismatch() {
        let mut t = tutor();
        t.subjects = vec!["ENG.PRI".into()];
        assert!(tutor_matches(&t, &assignment(), 12.0).is_none());
    }

    #[test]
    fn test_level_mismatch() {
        let mut t = tutor();
        t.levels = vec!["JC".into()];
        assert!(tutor_matches(&t, &assignment(), 12.0).is_none());
    }

    #[test]
    fn test_out_of_radius() {
        let mut t = tutor();
        // Jurong-side tutor, Tampines assignment
        t.home_lat = Some(1.3330);
        t.home_lon = Some(103.7422);
        t.max_distance_km = Some(5.0);
        assert!(tutor_matches(&t, &assignment(), 12.0).is_none());
    }

    #[test]
    fn test_missing_coords_passes_location_gate() {
        let mut a = assignment();
        a.postal_lat = None;
        a.postal_lon = None;
        let result = tutor_matches(&tutor(), &a, 12.0).unwrap();
        assert_eq!(result.distance_km, None);
    }

    #[test]
    fn test_general_code_matches_profile() {
        let mut t = tutor();
        t.subjects = vec!["MATH".into()];
        assert!(tutor_matches(&t, &assignment(), 12.0).is_some());
    }

    #[test]
    fn test_predict_rating_shape() {
        assert_eq!(predict_rating(None, false), 4.0);
        assert_eq!(predict_rating(None, true), 4.5);
        assert!(predict_rating(Some(8.0), true) < 4.5);
        assert!(predict_rating(Some(100.0), false) >= 1.0);
    }
}
