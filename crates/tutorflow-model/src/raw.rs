//! Raw upstream messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One ingested post, exactly as the collector stored it.
///
/// Immutable once committed; upstream edits advance `edited_at` and create a
/// new `source_last_seen` on the derived assignment, never a rewrite of the
/// original text here. `(channel, message_id)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: i64,
    /// Upstream channel identifier, e.g. `c/acme-tuition`.
    pub channel: String,
    /// Message id within the channel, opaque string.
    pub message_id: String,
    /// Agency this channel belongs to.
    pub agency_id: String,
    pub text: String,
    /// Source publish time as reported upstream.
    pub published_at: DateTime<Utc>,
    /// Last upstream edit, if any.
    pub edited_at: Option<DateTime<Utc>>,
    /// Collector-provided extras (media flags, forward info).
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Soft-delete marker set by the collector.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl RawMessage {
    /// Most recent upstream activity: edit time when present, else publish.
    #[must_use]
    pub fn source_last_seen(&self) -> DateTime<Utc> {
        self.edited_at.unwrap_or(self.published_at)
    }

    /// Link back to the source post, when the channel exposes one.
    #[must_use]
    pub fn message_link(&self) -> String {
        format!("https://t.me/{}/{}", self.channel.trim_start_matches("c/"), self.message_id)
    }
}
