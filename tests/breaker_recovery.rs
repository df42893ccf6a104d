//! Circuit breaker behavior end-to-end: trip, requeue, half-open recovery

mod common;

use chrono::Duration;
use common::{
    enqueue_and_claim, happy_extraction_json, ok_response, pipeline_with, seed_raw, test_config,
};
use tutorflow::llm::testing::ScriptedError;
use tutorflow::model::{AgencyHints, JobStatus};
use tutorflow::store::Store;
use tutorflow::worker::run_job;
use tutorflow_config::Config;

const HAPPY_TEXT: &str = "Sec 3 Math, Tampines 520123, $40/hr, Mon 7-9pm";

fn breaker_config(open_cooldown_s: u64) -> Config {
    let mut config = test_config();
    config.llm.breaker.window = 10;
    config.llm.breaker.min_calls = 5;
    config.llm.breaker.failure_ratio = 0.5;
    config.llm.breaker.open_cooldown_s = open_cooldown_s;
    config
}

#[tokio::test]
async fn consecutive_5xx_trips_breaker_and_requeues_jobs() {
    // 10 consecutive upstream failures, then a success the breaker must
    // prevent from being reached.
    let mut script: Vec<_> = (0..10).map(|_| Err(ScriptedError::ServerError(500))).collect();
    script.push(ok_response(&happy_extraction_json()));
    let pipeline = pipeline_with(breaker_config(3_600), script);

    // Trip the breaker with direct extractions.
    for _ in 0..10 {
        let err = pipeline
            .ctx
            .extractor
            .extract(HAPPY_TEXT, &AgencyHints::default())
            .await
            .unwrap_err();
        if matches!(err, tutorflow::llm::LlmError::CircuitOpen { .. }) {
            break;
        }
    }
    let calls_when_open = pipeline.backend.call_count();
    assert!(calls_when_open >= 5, "breaker needs min_calls to trip");

    // Open breaker: no upstream call is made for the next invocation.
    let err = pipeline
        .ctx
        .extractor
        .extract(HAPPY_TEXT, &AgencyHints::default())
        .await
        .unwrap_err();
    assert!(matches!(err, tutorflow::llm::LlmError::CircuitOpen { .. }));
    assert_eq!(pipeline.backend.call_count(), calls_when_open);

    // A job submitted now comes back as pending with circuit_open, not
    // failed.
    seed_raw(&pipeline.store, "c/a", "100", HAPPY_TEXT, Duration::hours(1)).await;
    let job = enqueue_and_claim(&pipeline, "c/a", "100").await;
    run_job(&pipeline.ctx, &job).await;

    let job = pipeline.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.meta.requeue_reason.as_deref(), Some("circuit_open"));
    assert_eq!(job.error.unwrap().error.as_str(), "circuit_open");
}

#[tokio::test]
async fn half_open_probe_success_lets_jobs_proceed() {
    // 5 failures trip the breaker; with zero cooldown the next call is
    // the half-open probe, which succeeds and closes the circuit.
    let mut script: Vec<_> = (0..5).map(|_| Err(ScriptedError::ServerError(503))).collect();
    script.push(ok_response(&happy_extraction_json()));
    let pipeline = pipeline_with(breaker_config(0), script);

    for _ in 0..5 {
        let _ = pipeline
            .ctx
            .extractor
            .extract(HAPPY_TEXT, &AgencyHints::default())
            .await;
    }

    seed_raw(&pipeline.store, "c/a", "100", HAPPY_TEXT, Duration::hours(1)).await;
    let job = enqueue_and_claim(&pipeline, "c/a", "100").await;
    run_job(&pipeline.ctx, &job).await;

    let job = pipeline.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Ok, "probe success must close the circuit");
    assert_eq!(job.meta.assignment_ids.len(), 1);
}
