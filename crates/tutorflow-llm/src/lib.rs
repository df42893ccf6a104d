//! LLM extraction with retry and circuit breaking
//!
//! The [`LlmBackend`] trait abstracts the model provider; production uses
//! the Anthropic Messages API over HTTP, tests use scripted backends. The
//! [`Extractor`] wires a backend together with the retry policy and the
//! per-model circuit breakers and owns the prompt contracts.

mod anthropic;
mod breaker;
mod compilation;
mod extractor;
mod retry;
pub mod testing;
mod types;

pub use anthropic::AnthropicBackend;
pub use breaker::{Admission, BreakerRegistry, BreakerState, CircuitBreaker};
pub use compilation::{CompilationHeuristic, DefaultCompilationHeuristic};
pub use extractor::Extractor;
pub use retry::RetryPolicy;
pub use types::{LlmBackend, LlmRequest, LlmResponse};

pub use tutorflow_utils::error::LlmError;
