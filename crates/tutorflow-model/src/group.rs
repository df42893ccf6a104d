//! Duplicate groups: clusters of cross-agency postings for one opportunity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Group lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    #[default]
    Active,
    Resolved,
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// A cluster of assignments advertising the same underlying opportunity.
///
/// The group owns the membership; each assignment carries only a weak
/// `duplicate_group_id` back-reference. Atomic membership and primary
/// transitions live in the detector, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: i64,
    /// Nullable only during transient states inside a merge.
    pub primary_assignment_id: Option<i64>,
    pub member_count: i32,
    pub avg_confidence_score: f64,
    pub status: GroupStatus,
    /// Version of the scoring algorithm that created or last merged this
    /// group.
    pub detection_algorithm_version: i32,
    #[serde(default)]
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
