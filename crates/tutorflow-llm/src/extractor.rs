//! The extraction entry point: prompts, breaker gating, JSON parsing

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::breaker::{Admission, BreakerRegistry};
use crate::retry::RetryPolicy;
use crate::types::{LlmBackend, LlmRequest};
use tutorflow_config::LlmConfig;
use tutorflow_model::{AgencyHints, CompilationSplit, ExtractedPayload};
use tutorflow_utils::error::LlmError;

/// System prompt for single-assignment extraction. The schema contract
/// mirrors [`ExtractedPayload`]; unknown values are omitted, never invented.
const EXTRACTION_SYSTEM: &str = "\
You extract tutoring assignment postings into JSON. Respond with a single \
JSON object and nothing else. Fields (omit any you cannot find): \
external_id, assignment_code, academic_display_text, subjects (array), \
levels (array), lesson_schedule (array), start_date, \
time_availability_note, tutor_types (array of {type, raw}), learning_mode \
(online|in_person|hybrid), address (array), postal_code (array of 6-digit \
strings actually present in the text), postal_code_estimated (array, \
6-digit strings you inferred from the named area), rate_raw_text, \
rate_breakdown, rate_min (number), rate_max (number). Never invent postal \
codes into postal_code; inferred ones go in postal_code_estimated.";

/// System prompt for compilation confirmation and splitting.
const COMPILATION_SYSTEM: &str = "\
You check whether a post contains multiple independent tutoring \
assignments. Respond with a single JSON object: {\"is_compilation\": \
bool, \"segments\": [string]}. When is_compilation is true, segments must \
partition the post into one self-contained text per assignment, in the \
original order, preserving every detail. When false, segments must be \
empty.";

/// Extraction front-end over a backend, with retry and per-model breakers.
pub struct Extractor {
    backend: Arc<dyn LlmBackend>,
    breakers: BreakerRegistry,
    retry: RetryPolicy,
    model: String,
    timeout: Duration,
}

impl Extractor {
    #[must_use]
    pub fn new(backend: Arc<dyn LlmBackend>, config: &LlmConfig) -> Self {
        Self {
            backend,
            breakers: BreakerRegistry::new(config.breaker.clone()),
            retry: RetryPolicy::new(config.llm_max_retries),
            model: config.llm_model.clone(),
            timeout: config.timeout(),
        }
    }

    /// Model id requests are issued under.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Extract one canonical payload from a raw post.
    ///
    /// Returns the payload plus the model id that produced it.
    ///
    /// # Errors
    ///
    /// `CircuitOpen` when the breaker rejects without calling upstream;
    /// transient classes after retry exhaustion; `SchemaInvalid` when the
    /// response is not valid payload JSON; `ClientError` for permanent
    /// upstream rejections.
    pub async fn extract(
        &self,
        raw_text: &str,
        hints: &AgencyHints,
    ) -> Result<(ExtractedPayload, String), LlmError> {
        let user = build_extraction_user(raw_text, hints);
        let response = self
            .gated_invoke(LlmRequest::new(
                self.model.clone(),
                EXTRACTION_SYSTEM,
                user,
                self.timeout,
            ))
            .await?;
        let value = parse_json_object(&response.text)?;
        let payload: ExtractedPayload = serde_json::from_value(value)
            .map_err(|e| LlmError::SchemaInvalid(e.to_string()))?;
        Ok((payload, response.model_used))
    }

    /// Confirm whether a flagged post is a compilation and split it.
    ///
    /// # Errors
    ///
    /// Same classes as [`Self::extract`].
    pub async fn confirm_and_split(&self, raw_text: &str) -> Result<CompilationSplit, LlmError> {
        let response = self
            .gated_invoke(LlmRequest::new(
                self.model.clone(),
                COMPILATION_SYSTEM,
                raw_text.to_string(),
                self.timeout,
            ))
            .await?;
        let value = parse_json_object(&response.text)?;
        let split: CompilationSplit =
            serde_json::from_value(value).map_err(|e| LlmError::SchemaInvalid(e.to_string()))?;
        if split.is_compilation && split.segments.len() < 2 {
            return Err(LlmError::SchemaInvalid(
                "compilation confirmed but fewer than 2 segments returned".to_string(),
            ));
        }
        Ok(split)
    }

    /// One invocation behind the breaker: full retry loop when `Allowed`,
    /// a single unretried call when admitted as the half-open probe.
    async fn gated_invoke(
        &self,
        req: LlmRequest,
    ) -> Result<crate::types::LlmResponse, LlmError> {
        let breaker = self.breakers.for_model(&req.model);
        match breaker.admit() {
            Admission::Rejected => {
                debug!(model = %req.model, "breaker rejected invocation");
                return Err(LlmError::CircuitOpen {
                    model: req.model.clone(),
                });
            }
            Admission::Probe => {
                let result = self.backend.complete(req).await;
                match &result {
                    Ok(_) => breaker.record_success(),
                    Err(e) if e.is_transient() => breaker.record_failure(),
                    // Permanent errors say nothing about upstream health
                    Err(_) => breaker.record_success(),
                }
                return result;
            }
            Admission::Allowed => {}
        }

        let backend = Arc::clone(&self.backend);
        let result = self
            .retry
            .run(|| {
                let req = req.clone();
                let backend = Arc::clone(&backend);
                let breaker = Arc::clone(&breaker);
                async move {
                    let out = backend.complete(req).await;
                    match &out {
                        Ok(_) => breaker.record_success(),
                        Err(e) if e.is_transient() => breaker.record_failure(),
                        Err(_) => {}
                    }
                    out
                }
            })
            .await;

        // The window may have tripped mid-retry; surface that to the caller
        // so the job requeues instead of burning the remaining budget.
        if let Err(err) = &result
            && err.is_transient()
            && breaker.state() == crate::breaker::BreakerState::Open
        {
            return Err(LlmError::CircuitOpen {
                model: req.model.clone(),
            });
        }
        result
    }
}

/// Append agency hints to the raw post.
fn build_extraction_user(raw_text: &str, hints: &AgencyHints) -> String {
    let mut user = String::new();
    if !hints.agency_id.is_empty() {
        user.push_str(&format!("Agency: {}\n", hints.agency_id));
    }
    if !hints.code_prefixes.is_empty() {
        user.push_str(&format!(
            "Known assignment-code prefixes: {}\n",
            hints.code_prefixes.join(", ")
        ));
    }
    if let Some(note) = &hints.prompt_note {
        user.push_str(note);
        user.push('\n');
    }
    user.push_str("\nPost:\n");
    user.push_str(raw_text);
    user
}

/// Pull the first JSON object out of a model response, tolerating code
/// fences and stray prose around it.
fn parse_json_object(text: &str) -> Result<serde_json::Value, LlmError> {
    let trimmed = text.trim();
    // Fast path: the whole response is the object
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed)
        && value.is_object()
    {
        return Ok(value);
    }
    let start = trimmed
        .find('{')
        .ok_or_else(|| LlmError::SchemaInvalid("no JSON object in response".to_string()))?;
    let end = trimmed
        .rfind('}')
        .ok_or_else(|| LlmError::SchemaInvalid("unterminated JSON object".to_string()))?;
    if end <= start {
        return Err(LlmError::SchemaInvalid("malformed JSON object".to_string()));
    }
    let value: serde_json::Value = serde_json::from_str(&trimmed[start..=end])
        .map_err(|e| LlmError::SchemaInvalid(e.to_string()))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(LlmError::SchemaInvalid("response is not a JSON object".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;
    use crate::types::LlmResponse;

    fn extractor_with(backend: ScriptedBackend) -> Extractor {
        Extractor::new(Arc::new(backend), &LlmConfig::default())
    }

    #[test]
    fn test_parse_plain_object() {
        let value = parse_json_object(r#"{"subjects": ["Math"]}"#).unwrap();
        assert_eq!(value["subjects"][0], "Math");
    }

    #[test]
    fn test_parse_fenced_object() {
        let text = "Here you go:\n```json\n{\"subjects\": [\"Math\"]}\n```\nDone.";
        let value = parse_json_object(text).unwrap();
        assert_eq!(value["subjects"][0], "Math");
    }

    #[test]
    fn test_parse_rejects_prose() {
        assert!(matches!(
            parse_json_object("I could not find an assignment."),
            Err(LlmError::SchemaInvalid(_))
        ));
    }

    #[test]
    fn test_parse_rejects_bare_array() {
        assert!(matches!(
            parse_json_object("[1, 2, 3]"),
            Err(LlmError::SchemaInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_extract_returns_payload_and_model() {
        let backend = ScriptedBackend::new(vec![Ok(LlmResponse::new(
            r#"{"subjects": ["Math"], "postal_code": ["520123"], "rate_min": 40, "rate_max": 40}"#,
            "test-model",
        ))]);
        let extractor = extractor_with(backend);
        let (payload, model) = extractor
            .extract("Sec 3 Math", &AgencyHints::default())
            .await
            .unwrap();
        assert_eq!(payload.subjects, vec!["Math"]);
        assert_eq!(payload.rate_min, Some(40));
        assert_eq!(model, "test-model");
    }

    #[tokio::test]
    async fn test_extract_schema_invalid_is_terminal() {
        let backend =
            ScriptedBackend::new(vec![Ok(LlmResponse::new("not json at all", "m"))]);
        let extractor = extractor_with(backend);
        let err = extractor
            .extract("text", &AgencyHints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::SchemaInvalid(_)));
    }

    #[tokio::test]
    async fn test_split_requires_two_segments() {
        let backend = ScriptedBackend::new(vec![Ok(LlmResponse::new(
            r#"{"is_compilation": true, "segments": ["only one"]}"#,
            "m",
        ))]);
        let extractor = extractor_with(backend);
        assert!(matches!(
            extractor.confirm_and_split("text").await,
            Err(LlmError::SchemaInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_hints_reach_the_prompt() {
        let hints = AgencyHints {
            agency_id: "acme".into(),
            code_prefixes: vec!["TA-".into()],
            prompt_note: Some("Rates are per month.".into()),
        };
        let user = build_extraction_user("post body", &hints);
        assert!(user.contains("Agency: acme"));
        assert!(user.contains("TA-"));
        assert!(user.contains("per month"));
        assert!(user.ends_with("post body"));
    }
}
