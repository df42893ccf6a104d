//! TutorFlow: tutoring-assignment aggregation pipeline
//!
//! This crate is the thin assembly layer over the workspace: it re-exports
//! the member crates under stable module names and provides the runtime
//! wiring the CLI uses to stand the daemon up.

pub use tutorflow_config as config;
pub use tutorflow_dedup as dedup;
pub use tutorflow_delivery as delivery;
pub use tutorflow_enrich as enrich;
pub use tutorflow_llm as llm;
pub use tutorflow_model as model;
pub use tutorflow_redaction as redaction;
pub use tutorflow_store as store;
pub use tutorflow_utils as utils;
pub use tutorflow_validate as validate;
pub use tutorflow_worker as worker;

pub mod cli;
pub mod runtime;
