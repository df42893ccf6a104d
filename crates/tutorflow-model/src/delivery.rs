//! Delivery-side records: clicks, broadcast posts, tutor profiles, ratings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Click counters per assignment `external_id`. Counts are monotone
/// non-decreasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickRecord {
    pub external_id: String,
    pub click_count: i64,
    /// Destination the click resolves to.
    pub original_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// The last broadcast-delivered post for one assignment, kept so the editor
/// loop can rewrite it when the displayed click bucket changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastRecord {
    pub external_id: String,
    pub channel: String,
    /// Transport-assigned message id of the live post.
    pub message_id: String,
    /// Content as last rendered, compared against re-renders.
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

/// A subscribed tutor's matching preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TutorProfile {
    pub id: i64,
    /// DM chat identifier on the delivery transport.
    pub chat_id: String,
    /// Canonical subject codes the tutor teaches.
    pub subjects: Vec<String>,
    /// Level keywords the tutor accepts (Primary, Secondary, JC, ...).
    pub levels: Vec<String>,
    pub home_lat: Option<f64>,
    pub home_lon: Option<f64>,
    /// Maximum assignment distance; falls back to the configured default.
    pub max_distance_km: Option<f64>,
    /// Minimum adaptive rating percentile gate, 0 disables.
    pub rating_threshold_percentile: Option<f64>,
    pub active: bool,
}

/// Per-(tutor, assignment) rating with the distance at send time; feeds the
/// adaptive threshold function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TutorRating {
    pub tutor_id: i64,
    pub assignment_id: i64,
    pub rating: f64,
    pub distance_km_at_send: Option<f64>,
    pub created_at: DateTime<Utc>,
}
