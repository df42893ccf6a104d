//! Listing query types: filters, sorts, keyset cursors

use serde::{Deserialize, Serialize};

use tutorflow_model::Assignment;
use tutorflow_utils::error::StoreError;

/// Hard cap on page size.
pub const MAX_PAGE_LIMIT: usize = 200;

/// Sort orders offered by the listing surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// `(_sort_ts desc, id desc)` where `_sort_ts = coalesce(published_at,
    /// created_at, last_seen)`.
    #[default]
    Newest,
    /// `(distance_sort_key asc, last_seen desc, id desc)`;
    /// assignments without coordinates sort last.
    Distance,
}

/// Filter set; all conjunctive, all optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListFilters {
    /// Level keyword over `signals_levels` (e.g. `Secondary`).
    pub level: Option<String>,
    /// Specific student level over `signals_specific_student_levels`.
    pub specific_level: Option<String>,
    /// Subject match over `signals_subjects ∪ subjects_canonical ∪
    /// subjects_general` (case-insensitive).
    pub subject: Option<String>,
    /// Exact general category code (`MATH`).
    pub general_code: Option<String>,
    /// Exact canonical subject code (`MATH.SEC_EMATH`).
    pub canonical_code: Option<String>,
    pub agency: Option<String>,
    pub learning_mode: Option<String>,
    /// Free-text location: matches address/postal text, or a region
    /// shorthand (`north|east|west|central|north-east`).
    pub location_text: Option<String>,
    /// Tutor-type tag matched by containment on the JSON array.
    pub tutor_type: Option<String>,
    pub min_rate: Option<i64>,
    /// When false, only group primaries (and ungrouped rows) are listed.
    pub show_duplicates: Option<bool>,
}

impl ListFilters {
    /// Effective `show_duplicates` (defaults to true).
    #[must_use]
    pub fn show_duplicates(&self) -> bool {
        self.show_duplicates.unwrap_or(true)
    }
}

/// One listing query.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub filters: ListFilters,
    pub sort: SortOrder,
    pub cursor: Option<String>,
    /// Clamped to [`MAX_PAGE_LIMIT`].
    pub limit: usize,
    /// Origin for the distance sort and per-row distances.
    pub origin: Option<(f64, f64)>,
}

/// One listed row with its computed distance (when both endpoints have
/// coordinates).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedAssignment {
    pub assignment: Assignment,
    pub distance_km: Option<f64>,
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub rows: Vec<ListedAssignment>,
    /// Total matches under the filters, identical on every page.
    pub total_count: u64,
    /// Opaque cursor for the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

/// Facet counts under a filter set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Facets {
    pub agencies: Vec<(String, u64)>,
    pub regions: Vec<(String, u64)>,
    pub levels: Vec<(String, u64)>,
    pub subjects_general: Vec<(String, u64)>,
}

/// Decoded keyset cursor.
///
/// Wire form is `<a>|<b>|<id>`: for newest, `a` is the sort timestamp in
/// microseconds and `b` is unused; for distance, `a` is the distance key in
/// metres (i64, `i64::MAX` for "no coordinates") and `b` is `last_seen`
/// in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Newest { sort_ts_micros: i64, id: i64 },
    Distance {
        distance_key_m: i64,
        last_seen_micros: i64,
        id: i64,
    },
}

impl Cursor {
    /// Encode to the opaque wire form.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Newest { sort_ts_micros, id } => format!("{sort_ts_micros}|0|{id}"),
            Self::Distance {
                distance_key_m,
                last_seen_micros,
                id,
            } => format!("{distance_key_m}|{last_seen_micros}|{id}"),
        }
    }

    /// Decode a cursor for the given sort order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidCursor` on any malformed input.
    pub fn decode(raw: &str, sort: SortOrder) -> Result<Self, StoreError> {
        let parts: Vec<&str> = raw.split('|').collect();
        let [a, b, id] = parts.as_slice() else {
            return Err(StoreError::InvalidCursor(raw.to_string()));
        };
        let parse = |s: &str| {
            s.parse::<i64>()
                .map_err(|_| StoreError::InvalidCursor(raw.to_string()))
        };
        match sort {
            SortOrder::Newest => Ok(Self::Newest {
                sort_ts_micros: parse(a)?,
                id: parse(id)?,
            }),
            SortOrder::Distance => Ok(Self::Distance {
                distance_key_m: parse(a)?,
                last_seen_micros: parse(b)?,
                id: parse(id)?,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_cursor_round_trip() {
        let cursor = Cursor::Newest {
            sort_ts_micros: 1_700_000_000_000_000,
            id: 42,
        };
        let decoded = Cursor::decode(&cursor.encode(), SortOrder::Newest).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn test_distance_cursor_round_trip() {
        let cursor = Cursor::Distance {
            distance_key_m: 3_500,
            last_seen_micros: 1_700_000_000_000_000,
            id: 7,
        };
        let decoded = Cursor::decode(&cursor.encode(), SortOrder::Distance).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn test_malformed_cursor_rejected() {
        assert!(matches!(
            Cursor::decode("not-a-cursor", SortOrder::Newest),
            Err(StoreError::InvalidCursor(_))
        ));
        assert!(matches!(
            Cursor::decode("1|2", SortOrder::Newest),
            Err(StoreError::InvalidCursor(_))
        ));
        assert!(matches!(
            Cursor::decode("1|x|3", SortOrder::Distance),
            Err(StoreError::InvalidCursor(_))
        ));
    }

    #[test]
    fn test_show_duplicates_defaults_true() {
        assert!(ListFilters::default().show_duplicates());
        let filters = ListFilters {
            show_duplicates: Some(false),
            ..ListFilters::default()
        };
        assert!(!filters.show_duplicates());
    }
}
