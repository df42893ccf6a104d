//! Scripted backends for tests
//!
//! Test seam; not part of the public API stability guarantees.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::types::{LlmBackend, LlmRequest, LlmResponse};
use tutorflow_utils::error::LlmError;

/// Backend that replays a scripted sequence of results.
///
/// Results pop in order; once the script is exhausted every further call
/// fails with a transport error, which keeps forgotten-to-script mistakes
/// loud in tests.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<LlmResponse, ScriptedError>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

/// Cloneable error template, expanded into a fresh `LlmError` per call.
#[derive(Debug, Clone)]
pub enum ScriptedError {
    Transport,
    ServerError(u16),
    RateLimited,
    Timeout,
    ClientError(u16),
    SchemaInvalid,
}

impl ScriptedError {
    fn into_llm_error(self) -> LlmError {
        match self {
            Self::Transport => LlmError::Transport("scripted transport failure".into()),
            Self::ServerError(status) => LlmError::ServerError { status },
            Self::RateLimited => LlmError::RateLimited { retry_after: None },
            Self::Timeout => LlmError::Timeout {
                timeout: Duration::from_secs(1),
            },
            Self::ClientError(status) => LlmError::ClientError {
                status,
                message: "scripted client error".into(),
            },
            Self::SchemaInvalid => LlmError::SchemaInvalid("scripted schema error".into()),
        }
    }
}

impl ScriptedBackend {
    #[must_use]
    pub fn new(script: Vec<Result<LlmResponse, ScriptedError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Convenience: a backend that answers every call with the same JSON
    /// text. Modeled as a long pre-loaded script rather than a second code
    /// path.
    #[must_use]
    pub fn always(json_text: &str) -> Self {
        let script = (0..1_000)
            .map(|_| Ok(LlmResponse::new(json_text, "scripted-model")))
            .collect();
        Self {
            script: Mutex::new(script),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests observed so far, for asserting on prompts.
    #[must_use]
    pub fn seen_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Number of calls made.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(req);
        let next = self
            .script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(template)) => Err(template.into_llm_error()),
            None => Err(LlmError::Transport("scripted backend exhausted".into())),
        }
    }
}
