//! Backend abstraction types

use async_trait::async_trait;
use std::time::Duration;

use tutorflow_utils::error::LlmError;

/// Input to one backend invocation.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    /// System prompt; the extraction schema contract lives here.
    pub system: String,
    /// User content: the raw post plus agency hints.
    pub user: String,
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl LlmRequest {
    #[must_use]
    pub fn new(
        model: impl Into<String>,
        system: impl Into<String>,
        user: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            model: model.into(),
            system: system.into(),
            user: user.into(),
            timeout,
            max_tokens: 2048,
            temperature: 0.0,
        }
    }
}

/// Result of one backend invocation.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Raw response text; the extractor parses JSON out of it.
    pub text: String,
    /// Model that actually served the request.
    pub model_used: String,
    pub tokens_input: Option<u64>,
    pub tokens_output: Option<u64>,
}

impl LlmResponse {
    #[must_use]
    pub fn new(text: impl Into<String>, model_used: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model_used: model_used.into(),
            tokens_input: None,
            tokens_output: None,
        }
    }
}

/// Trait for model providers.
///
/// Implementations classify their failures into the [`LlmError`] retry
/// classes; the retry loop and breaker act on that classification alone.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Invoke the model once. No retries at this layer.
    ///
    /// # Errors
    ///
    /// Returns `LlmError` classified by retryability; see
    /// [`LlmError::is_transient`].
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError>;
}
