//! Shared helpers for the end-to-end scenario tests
//!
//! Everything runs against the in-memory store with a scripted LLM
//! backend and the recording delivery transport.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tutorflow::llm::testing::{ScriptedBackend, ScriptedError};
use tutorflow::llm::{LlmBackend, LlmResponse};
use tutorflow::model::RawMessage;
use tutorflow::store::{MemoryStore, NewRawMessage, Store};
use tutorflow::worker::WorkerContext;
use tutorflow_config::Config;
use tutorflow_delivery::RecordingTransport;

/// Handles for one wired test pipeline.
pub struct TestPipeline {
    pub ctx: Arc<WorkerContext>,
    pub store: Arc<MemoryStore>,
    pub backend: Arc<ScriptedBackend>,
    pub transport: Arc<RecordingTransport>,
}

/// Test config: single worker, tiny batches, no LLM retries so every
/// scripted response maps to exactly one backend call.
pub fn test_config() -> Config {
    let mut config = Config::minimal_for_testing();
    config.llm.llm_max_retries = 0;
    config
}

/// Wire a pipeline over the given scripted responses.
pub fn pipeline_with(config: Config, script: Vec<Result<LlmResponse, ScriptedError>>) -> TestPipeline {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(ScriptedBackend::new(script));
    let transport = Arc::new(RecordingTransport::new());
    let dyn_backend: Arc<dyn LlmBackend> = Arc::clone(&backend) as Arc<dyn LlmBackend>;
    let ctx = tutorflow::runtime::build_context_with_transport(
        config,
        Arc::clone(&store) as Arc<dyn Store>,
        dyn_backend,
        Arc::clone(&transport) as Arc<dyn tutorflow_delivery::DeliveryTransport>,
    )
    .expect("context wiring");
    TestPipeline {
        ctx,
        store,
        backend,
        transport,
    }
}

/// Seed one raw message published `age` ago.
pub async fn seed_raw(
    store: &MemoryStore,
    channel: &str,
    message_id: &str,
    text: &str,
    age: Duration,
) -> RawMessage {
    store
        .insert_raw(NewRawMessage {
            channel: channel.to_string(),
            message_id: message_id.to_string(),
            agency_id: channel.trim_start_matches("c/").to_string(),
            text: text.to_string(),
            published_at: Utc::now() - age,
            edited_at: None,
            payload: serde_json::Value::Null,
        })
        .await
        .expect("seed raw")
}

/// Enqueue and claim a single job for the test pipeline version.
pub async fn enqueue_and_claim(
    pipeline: &TestPipeline,
    channel: &str,
    message_id: &str,
) -> tutorflow::model::ExtractionJob {
    let version = pipeline.ctx.config.pipeline_version.clone();
    pipeline
        .store
        .enqueue(&version, channel, &[message_id.to_string()], false)
        .await
        .expect("enqueue");
    let mut claimed = pipeline.store.claim(&version, 1).await.expect("claim");
    assert_eq!(claimed.len(), 1, "expected exactly one claimable job");
    claimed.remove(0)
}

/// Scripted response body for the standard happy-path post.
pub fn happy_extraction_json() -> String {
    serde_json::json!({
        "academic_display_text": "Sec 3 Math",
        "subjects": ["Math"],
        "levels": ["Secondary"],
        "postal_code": ["520123"],
        "rate_min": 40,
        "rate_max": 40,
        "time_availability_note": "Mon 7-9pm"
    })
    .to_string()
}

pub fn ok_response(json: &str) -> Result<LlmResponse, ScriptedError> {
    Ok(LlmResponse::new(json, "scripted-model"))
}

pub fn now_minus_hours(h: i64) -> DateTime<Utc> {
    Utc::now() - Duration::hours(h)
}
