//! The canonical, query-facing assignment entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status. Assignments are never hard-deleted; closing flips this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    #[default]
    Open,
    Closed,
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Coarse recency bucket indicating how likely the post is still open.
///
/// Recomputed periodically from the age of `source_last_seen`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
pub enum FreshnessTier {
    #[default]
    Green,
    Yellow,
    Orange,
    Red,
}

impl fmt::Display for FreshnessTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Green => write!(f, "green"),
            Self::Yellow => write!(f, "yellow"),
            Self::Orange => write!(f, "orange"),
            Self::Red => write!(f, "red"),
        }
    }
}

/// Singapore planning region, resolved from the postal sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::EnumIter)]
pub enum Region {
    North,
    East,
    West,
    Central,
    #[serde(rename = "North-East")]
    NorthEast,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::North => write!(f, "North"),
            Self::East => write!(f, "East"),
            Self::West => write!(f, "West"),
            Self::Central => write!(f, "Central"),
            Self::NorthEast => write!(f, "North-East"),
        }
    }
}

impl FromStr for Region {
    type Err = ();

    /// Accepts the display form and the listing-filter shorthand
    /// (`north|east|west|central|north-east`, case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "north" => Ok(Self::North),
            "east" => Ok(Self::East),
            "west" => Ok(Self::West),
            "central" => Ok(Self::Central),
            "north-east" | "northeast" | "north east" => Ok(Self::NorthEast),
            _ => Err(()),
        }
    }
}

/// One tagged tutor-type entry, e.g. `{"type": "full_time", "raw": "FT tutors only"}`.
///
/// Stored as a JSON array column; the listing filter matches with JSONB
/// containment on the `type` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TutorType {
    #[serde(rename = "type")]
    pub kind: String,
    /// Original phrasing from the post, kept for display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl TutorType {
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            raw: None,
        }
    }
}

/// The canonical tutoring opportunity as displayed to tutors.
///
/// Identity is `(agency_id, external_id)`; `id` is the store-assigned row
/// id. Mutated only through the upsert merge policy and the duplicate /
/// delivery side-effect paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: i64,

    // Identity & provenance
    pub agency_id: String,
    pub external_id: String,
    /// Agency-visible assignment code, when the post carries one.
    pub assignment_code: Option<String>,
    pub message_link: Option<String>,

    // Display
    pub academic_display_text: Option<String>,
    pub lesson_schedule: Vec<String>,
    pub start_date: Option<String>,
    pub time_availability_note: Option<String>,
    pub tutor_types: Vec<TutorType>,
    pub rate_raw_text: Option<String>,
    pub rate_breakdown: Option<String>,
    pub learning_mode: Option<String>,

    // Location
    pub address: Vec<String>,
    pub postal_code: Vec<String>,
    pub postal_code_estimated: Vec<String>,
    pub postal_lat: Option<f64>,
    pub postal_lon: Option<f64>,
    pub postal_coords_estimated: bool,
    pub region: Option<Region>,
    pub nearest_mrt_computed: Option<String>,
    pub nearest_mrt_computed_line: Option<String>,
    pub nearest_mrt_computed_distance_m: Option<i32>,

    // Numeric
    pub rate_min: Option<i64>,
    pub rate_max: Option<i64>,

    // Deterministic signals, independent of the LLM
    pub signals_subjects: Vec<String>,
    pub signals_levels: Vec<String>,
    pub signals_specific_student_levels: Vec<String>,

    // Canonicalization
    pub subjects_canonical: Vec<String>,
    pub subjects_general: Vec<String>,
    pub canonicalization_version: i32,

    // Temporal
    /// First time this assignment was seen, preserved across upserts.
    pub created_at: DateTime<Utc>,
    /// Source publish time; drives the "newest" sort.
    pub published_at: Option<DateTime<Utc>>,
    /// Last upstream bump or edit.
    pub source_last_seen: Option<DateTime<Utc>>,
    /// Last time the pipeline processed this assignment.
    pub last_seen: DateTime<Utc>,

    // Lifecycle
    pub status: AssignmentStatus,
    pub freshness_tier: FreshnessTier,
    pub bump_count: i32,

    // Duplication
    pub duplicate_group_id: Option<i64>,
    pub is_primary_in_group: bool,
    pub duplicate_confidence_score: Option<f64>,
}

impl Assignment {
    /// Sort timestamp for the "newest" listing order:
    /// `coalesce(published_at, created_at, last_seen)`.
    #[must_use]
    pub fn sort_ts(&self) -> DateTime<Utc> {
        self.published_at.unwrap_or(self.created_at)
    }

    /// Best rate range for overlap checks, `None` when no numerics exist.
    #[must_use]
    pub fn rate_range(&self) -> Option<(i64, i64)> {
        match (self.rate_min, self.rate_max) {
            (Some(min), Some(max)) => Some((min, max)),
            (Some(min), None) => Some((min, min)),
            (None, Some(max)) => Some((max, max)),
            (None, None) => None,
        }
    }

    /// Levels union used by the duplicate detector.
    #[must_use]
    pub fn all_level_signals(&self) -> Vec<String> {
        let mut out = self.signals_levels.clone();
        for lvl in &self.signals_specific_student_levels {
            if !out.contains(lvl) {
                out.push(lvl.clone());
            }
        }
        out
    }
}

/// The row the worker builds for an upsert: everything the pipeline knows
/// about one extraction, before the store applies its merge policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentDraft {
    pub agency_id: String,
    pub external_id: String,
    pub assignment_code: Option<String>,
    pub message_link: Option<String>,

    pub academic_display_text: Option<String>,
    pub lesson_schedule: Vec<String>,
    pub start_date: Option<String>,
    pub time_availability_note: Option<String>,
    pub tutor_types: Vec<TutorType>,
    pub rate_raw_text: Option<String>,
    pub rate_breakdown: Option<String>,
    pub learning_mode: Option<String>,

    pub address: Vec<String>,
    pub postal_code: Vec<String>,
    pub postal_code_estimated: Vec<String>,
    pub postal_lat: Option<f64>,
    pub postal_lon: Option<f64>,
    pub postal_coords_estimated: bool,
    pub region: Option<Region>,
    pub nearest_mrt_computed: Option<String>,
    pub nearest_mrt_computed_line: Option<String>,
    pub nearest_mrt_computed_distance_m: Option<i32>,

    pub rate_min: Option<i64>,
    pub rate_max: Option<i64>,

    pub signals_subjects: Vec<String>,
    pub signals_levels: Vec<String>,
    pub signals_specific_student_levels: Vec<String>,

    pub subjects_canonical: Vec<String>,
    pub subjects_general: Vec<String>,
    pub canonicalization_version: i32,

    pub published_at: Option<DateTime<Utc>>,
    pub source_last_seen: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(s: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(s, 0).unwrap()
    }

    fn minimal(id: i64) -> Assignment {
        Assignment {
            id,
            agency_id: "acme".into(),
            external_id: "a-1".into(),
            assignment_code: None,
            message_link: None,
            academic_display_text: None,
            lesson_schedule: vec![],
            start_date: None,
            time_availability_note: None,
            tutor_types: vec![],
            rate_raw_text: None,
            rate_breakdown: None,
            learning_mode: None,
            address: vec![],
            postal_code: vec![],
            postal_code_estimated: vec![],
            postal_lat: None,
            postal_lon: None,
            postal_coords_estimated: false,
            region: None,
            nearest_mrt_computed: None,
            nearest_mrt_computed_line: None,
            nearest_mrt_computed_distance_m: None,
            rate_min: None,
            rate_max: None,
            signals_subjects: vec![],
            signals_levels: vec![],
            signals_specific_student_levels: vec![],
            subjects_canonical: vec![],
            subjects_general: vec![],
            canonicalization_version: 1,
            created_at: ts(1_000),
            published_at: None,
            source_last_seen: None,
            last_seen: ts(2_000),
            status: AssignmentStatus::Open,
            freshness_tier: FreshnessTier::Green,
            bump_count: 0,
            duplicate_group_id: None,
            is_primary_in_group: true,
            duplicate_confidence_score: None,
        }
    }

    #[test]
    fn test_sort_ts_prefers_published_at() {
        let mut a = minimal(1);
        assert_eq!(a.sort_ts(), ts(1_000));
        a.published_at = Some(ts(500));
        assert_eq!(a.sort_ts(), ts(500));
    }

    #[test]
    fn test_rate_range_widens_single_bound() {
        let mut a = minimal(1);
        assert_eq!(a.rate_range(), None);
        a.rate_min = Some(40);
        assert_eq!(a.rate_range(), Some((40, 40)));
        a.rate_max = Some(55);
        assert_eq!(a.rate_range(), Some((40, 55)));
    }

    #[test]
    fn test_region_shorthand_parse() {
        assert_eq!("north-east".parse::<Region>(), Ok(Region::NorthEast));
        assert_eq!("EAST".parse::<Region>(), Ok(Region::East));
        assert!("southwest".parse::<Region>().is_err());
    }

    #[test]
    fn test_level_signals_deduplicate() {
        let mut a = minimal(1);
        a.signals_levels = vec!["Secondary".into()];
        a.signals_specific_student_levels = vec!["Sec 3".into(), "Secondary".into()];
        assert_eq!(
            a.all_level_signals(),
            vec!["Secondary".to_string(), "Sec 3".to_string()]
        );
    }

    #[test]
    fn test_tutor_type_serde_shape() {
        let tt = TutorType {
            kind: "full_time".into(),
            raw: Some("FT only".into()),
        };
        let json = serde_json::to_value(&tt).unwrap();
        assert_eq!(json["type"], "full_time");
        assert_eq!(json["raw"], "FT only");
    }
}
