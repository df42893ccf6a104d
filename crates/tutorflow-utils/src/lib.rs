//! Shared infrastructure for the tutorflow workspace
//!
//! This crate holds the pieces every other crate leans on: the error
//! taxonomy, tracing initialization, and the in-process metrics registry.
//! It deliberately has no domain knowledge; domain records live in
//! `tutorflow-model`.

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::TutorFlowError;
pub use metrics::MetricsRegistry;
