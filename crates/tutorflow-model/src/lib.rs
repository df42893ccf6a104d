//! Canonical domain records for the tutorflow pipeline
//!
//! The types here are the shared vocabulary between the extraction worker,
//! the store adapters, the duplicate detector, and delivery. Dynamic JSON
//! only exists at the LLM boundary ([`extract::ExtractedPayload`]); it is
//! converted into these typed records immediately after schema validation.

pub mod assignment;
pub mod delivery;
pub mod extract;
pub mod group;
pub mod job;
pub mod raw;

pub use assignment::{
    Assignment, AssignmentDraft, AssignmentStatus, FreshnessTier, Region, TutorType,
};
pub use delivery::{BroadcastRecord, ClickRecord, TutorProfile, TutorRating};
pub use extract::{AgencyHints, CompilationSplit, ExtractedPayload};
pub use group::{DuplicateGroup, GroupStatus};
pub use job::{ErrorCode, ExtractionJob, JobError, JobMeta, JobOutcome, JobStatus};
pub use raw::RawMessage;
