//! Property tests for the deterministic core: enricher idempotence,
//! canonicalization identity, score clamping, cursor round-trips, click
//! monotonicity

use proptest::prelude::*;

use tutorflow::enrich::{CanonicalSubjects, canonicalize, enrich};
use tutorflow::model::ExtractedPayload;
use tutorflow::store::listing::{Cursor, SortOrder};
use tutorflow::store::{MemoryStore, Store};

fn payload_for(raw: &str) -> ExtractedPayload {
    ExtractedPayload {
        subjects: vec!["Math".into()],
        postal_code: if raw.contains("520123") {
            vec!["520123".into()]
        } else {
            vec![]
        },
        ..ExtractedPayload::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Running the enricher chain twice over the same input is bit-identical.
    #[test]
    fn enricher_chain_is_idempotent(raw in "[ -~]{0,200}") {
        let payload = payload_for(&raw);
        let first = enrich(&payload, &raw);
        let second = enrich(&payload, &raw);
        prop_assert_eq!(first, second);
    }

    /// Re-canonicalizing the produced codes is the identity.
    #[test]
    fn canonicalization_fixed_point(
        labels in prop::collection::vec(
            prop::sample::select(vec![
                "math", "a math", "english", "physics", "chemistry",
                "poa", "gp", "chinese", "geography", "nonsense-subject",
            ]),
            0..5,
        ),
        level in prop::sample::select(vec!["Primary", "Secondary", "JC", ""]),
    ) {
        let levels: Vec<String> = if level.is_empty() {
            vec![]
        } else {
            vec![level.to_string()]
        };
        let labels: Vec<String> = labels.into_iter().map(str::to_string).collect();
        let first: CanonicalSubjects = canonicalize(&levels, &labels);
        let again = canonicalize(&levels, &first.canonical);
        prop_assert_eq!(&again.canonical, &first.canonical);
        prop_assert_eq!(&again.general, &first.general);
        // Defined aliases always produce non-empty stable codes.
        if labels.iter().any(|l| l != "nonsense-subject") {
            prop_assert!(!first.canonical.is_empty());
        }
    }

    /// Pair scores never leave [0, 100] whatever the inputs look like.
    #[test]
    fn dedup_score_is_clamped(
        postal_a in "[0-9]{6}",
        postal_b in "[0-9]{6}",
        rate_a in 10i64..200,
        rate_b in 10i64..200,
    ) {
        use tutorflow::dedup::score_pair;
        use tutorflow_config::DedupWeights;

        let mut a = base_assignment(1, "acme");
        a.postal_code = vec![postal_a];
        a.rate_min = Some(rate_a);
        a.rate_max = Some(rate_a + 10);
        a.subjects_canonical = vec!["MATH.SEC_EMATH".into()];
        a.signals_levels = vec!["Secondary".into()];
        a.time_availability_note = Some("Mon 7pm".into());

        let mut c = base_assignment(2, "beta");
        c.postal_code = vec![postal_b];
        c.rate_min = Some(rate_b);
        c.rate_max = Some(rate_b + 10);
        c.subjects_canonical = vec!["MATH.SEC_EMATH".into()];
        c.signals_levels = vec!["Secondary".into()];
        c.time_availability_note = Some("Monday 7pm".into());

        let score = score_pair(&a, &c, &DedupWeights::default(), 2);
        prop_assert!((0.0..=100.0).contains(&score.total), "total = {}", score.total);
    }

    /// Cursors survive the encode/decode round trip for any key values.
    #[test]
    fn cursor_round_trip(ts in any::<i64>(), id in any::<i64>(), key in any::<i64>()) {
        let newest = Cursor::Newest { sort_ts_micros: ts, id };
        prop_assert_eq!(
            Cursor::decode(&newest.encode(), SortOrder::Newest).unwrap(),
            newest
        );
        let distance = Cursor::Distance {
            distance_key_m: key,
            last_seen_micros: ts,
            id,
        };
        prop_assert_eq!(
            Cursor::decode(&distance.encode(), SortOrder::Distance).unwrap(),
            distance
        );
    }

    /// Click counts are monotone under any delta sequence and equal the
    /// sum of the non-negative deltas.
    #[test]
    fn clicks_monotone_under_any_deltas(deltas in prop::collection::vec(-50i64..50, 0..12)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let store = MemoryStore::new();
            let mut last = 0i64;
            let mut expected = 0i64;
            for delta in &deltas {
                let count = store.increment_clicks("k", None, *delta).await.unwrap();
                assert!(count >= last);
                expected += (*delta).max(0);
                last = count;
            }
            assert_eq!(last, expected);
        });
    }
}

fn base_assignment(id: i64, agency: &str) -> tutorflow::model::Assignment {
    use chrono::{TimeZone, Utc};
    use tutorflow::model::{Assignment, AssignmentStatus, FreshnessTier};
    Assignment {
        id,
        agency_id: agency.into(),
        external_id: format!("{agency}-{id}"),
        assignment_code: None,
        message_link: None,
        academic_display_text: None,
        lesson_schedule: vec![],
        start_date: None,
        time_availability_note: None,
        tutor_types: vec![],
        rate_raw_text: None,
        rate_breakdown: None,
        learning_mode: None,
        address: vec![],
        postal_code: vec![],
        postal_code_estimated: vec![],
        postal_lat: None,
        postal_lon: None,
        postal_coords_estimated: false,
        region: None,
        nearest_mrt_computed: None,
        nearest_mrt_computed_line: None,
        nearest_mrt_computed_distance_m: None,
        rate_min: None,
        rate_max: None,
        signals_subjects: vec![],
        signals_levels: vec![],
        signals_specific_student_levels: vec![],
        subjects_canonical: vec![],
        subjects_general: vec![],
        canonicalization_version: 1,
        created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        published_at: Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
        source_last_seen: None,
        last_seen: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        status: AssignmentStatus::Open,
        freshness_tier: FreshnessTier::Green,
        bump_count: 0,
        duplicate_group_id: None,
        is_primary_in_group: true,
        duplicate_confidence_score: None,
    }
}
