//! Cross-agency duplicate grouping scenarios

mod common;

use chrono::Duration;
use common::{enqueue_and_claim, ok_response, pipeline_with, seed_raw, test_config};
use tutorflow::model::{AssignmentStatus, JobStatus};
use tutorflow::store::Store;
use tutorflow::worker::run_job;

fn extraction(code: &str) -> String {
    serde_json::json!({
        "assignment_code": code,
        "academic_display_text": "Sec 3 Math",
        "subjects": ["Math"],
        "levels": ["Secondary"],
        "postal_code": ["520123"],
        "rate_min": 40, "rate_max": 40,
        "time_availability_note": "Mon 7-9pm"
    })
    .to_string()
}

#[tokio::test]
async fn duplicate_across_agencies_forms_group() {
    let script = vec![
        ok_response(&extraction("A-100")),
        ok_response(&extraction("B-55")),
    ];
    let pipeline = pipeline_with(test_config(), script);

    let text = "Sec 3 Math, Tampines 520123, $40/hr, Mon 7-9pm";
    seed_raw(&pipeline.store, "c/acme", "100", text, Duration::hours(3)).await;
    seed_raw(&pipeline.store, "c/beta", "55", text, Duration::hours(1)).await;

    let job1 = enqueue_and_claim(&pipeline, "c/acme", "100").await;
    run_job(&pipeline.ctx, &job1).await;
    let job2 = enqueue_and_claim(&pipeline, "c/beta", "55").await;
    run_job(&pipeline.ctx, &job2).await;

    for id in [job1.id, job2.id] {
        assert_eq!(
            pipeline.store.get_job(id).await.unwrap().unwrap().status,
            JobStatus::Ok
        );
    }

    let first = pipeline
        .store
        .get_assignment_by_identity("acme", "A-100")
        .await
        .unwrap()
        .unwrap();
    let second = pipeline
        .store
        .get_assignment_by_identity("beta", "B-55")
        .await
        .unwrap()
        .unwrap();

    let group_id = first.duplicate_group_id.expect("first linked");
    assert_eq!(second.duplicate_group_id, Some(group_id));

    let group = pipeline.store.get_group(group_id).await.unwrap().unwrap();
    assert_eq!(group.member_count, 2);
    assert!(group.avg_confidence_score >= 70.0);

    // The earlier-published post is the primary.
    assert!(first.is_primary_in_group);
    assert!(!second.is_primary_in_group);
    assert_eq!(group.primary_assignment_id, Some(first.id));
}

#[tokio::test]
async fn non_primary_member_is_not_broadcast() {
    let script = vec![
        ok_response(&extraction("A-100")),
        ok_response(&extraction("B-55")),
    ];
    let pipeline = pipeline_with(test_config(), script);
    let text = "Sec 3 Math, Tampines 520123, $40/hr, Mon 7-9pm";
    seed_raw(&pipeline.store, "c/acme", "100", text, Duration::hours(3)).await;
    seed_raw(&pipeline.store, "c/beta", "55", text, Duration::hours(1)).await;

    let job1 = enqueue_and_claim(&pipeline, "c/acme", "100").await;
    run_job(&pipeline.ctx, &job1).await;
    let job2 = enqueue_and_claim(&pipeline, "c/beta", "55").await;
    run_job(&pipeline.ctx, &job2).await;

    // Only the primary (first) assignment reached the feed; the second
    // was linked as non-primary before its delivery stage ran.
    let broadcasts = pipeline.transport.sent_broadcasts();
    assert_eq!(broadcasts.len(), 1);
    assert!(broadcasts[0].content.contains("Sec 3 Math"));
}

#[tokio::test]
async fn closing_the_primary_promotes_the_next_member() {
    let script = vec![
        ok_response(&extraction("A-100")),
        ok_response(&extraction("B-55")),
    ];
    let pipeline = pipeline_with(test_config(), script);
    let text = "Sec 3 Math, Tampines 520123, $40/hr, Mon 7-9pm";
    seed_raw(&pipeline.store, "c/acme", "100", text, Duration::hours(3)).await;
    seed_raw(&pipeline.store, "c/beta", "55", text, Duration::hours(1)).await;
    let job1 = enqueue_and_claim(&pipeline, "c/acme", "100").await;
    run_job(&pipeline.ctx, &job1).await;
    let job2 = enqueue_and_claim(&pipeline, "c/beta", "55").await;
    run_job(&pipeline.ctx, &job2).await;

    let first = pipeline
        .store
        .get_assignment_by_identity("acme", "A-100")
        .await
        .unwrap()
        .unwrap();
    let group_id = first.duplicate_group_id.unwrap();

    pipeline
        .store
        .set_assignment_status(first.id, AssignmentStatus::Closed)
        .await
        .unwrap();
    let promoted = pipeline
        .ctx
        .detector
        .on_member_closed(group_id)
        .await
        .unwrap();

    let second = pipeline
        .store
        .get_assignment_by_identity("beta", "B-55")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(promoted, Some(second.id));
    assert!(second.is_primary_in_group);

    // Exactly one primary at all times.
    let members = pipeline.store.group_members(group_id).await.unwrap();
    assert_eq!(members.iter().filter(|m| m.is_primary_in_group).count(), 1);
}
