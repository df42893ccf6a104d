//! Delivery fanout: DMs to matching tutors plus the broadcast feed
//!
//! Fanout runs as a non-blocking side-effect after a successful upsert.
//! Non-primary duplicate-group members are filtered per configuration,
//! sends are deduplicated per `(tutor, assignment)` and throttled with
//! token buckets, and the broadcast post is edited in place when the
//! displayed click bucket changes.

pub mod matcher;
pub mod render;
pub mod throttle;
pub mod transport;

use std::sync::Arc;
use tracing::{debug, info, warn};

use tutorflow_config::{BroadcastDuplicateMode, DeliveryConfig};
use tutorflow_model::{Assignment, BroadcastRecord};
use tutorflow_store::Store;
use tutorflow_utils::error::DeliveryError;

pub use matcher::{MatchResult, predict_rating, tutor_matches};
pub use render::{click_bucket, render_broadcast, render_dm};
pub use throttle::RateLimiter;
pub use transport::{DeliveryTransport, RecordingTransport, SentBroadcast, SentDm};

/// Counters from one fanout pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub dms_sent: u32,
    /// Skipped because `(tutor, assignment)` was already delivered.
    pub dms_deduped: u32,
    pub dms_throttled: u32,
    /// Skipped by the adaptive rating-threshold gate.
    pub dms_gated: u32,
    pub dms_failed: u32,
    pub broadcast_sent: bool,
    /// Broadcast suppressed by the channel throttle.
    pub broadcast_throttled: bool,
    /// Everything skipped because the row is a non-primary duplicate.
    pub skipped_non_primary: bool,
}

/// The fanout service.
pub struct DeliveryService {
    store: Arc<dyn Store>,
    transport: Arc<dyn DeliveryTransport>,
    config: DeliveryConfig,
    broadcast_channel: String,
    dm_limiter: RateLimiter,
    broadcast_limiter: RateLimiter,
}

impl DeliveryService {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn DeliveryTransport>,
        config: DeliveryConfig,
        broadcast_channel: impl Into<String>,
    ) -> Self {
        let dm_limiter = RateLimiter::new(config.dm_rate_per_minute);
        let broadcast_limiter = RateLimiter::new(config.broadcast_rate_per_minute);
        Self {
            store,
            transport,
            config,
            broadcast_channel: broadcast_channel.into(),
            dm_limiter,
            broadcast_limiter,
        }
    }

    /// Fan one newly upserted assignment out to tutors and the feed.
    ///
    /// # Errors
    ///
    /// Only store-level failures surface; individual send failures are
    /// counted in the report and logged, delivery is at-least-once.
    pub async fn fanout(&self, assignment: &Assignment) -> Result<DeliveryReport, DeliveryError> {
        let mut report = DeliveryReport::default();

        let dm_allowed = assignment.is_primary_in_group || !self.config.dm_skip_duplicates;
        let broadcast_allowed = assignment.is_primary_in_group
            || self.config.broadcast_duplicate_mode == BroadcastDuplicateMode::All;

        if !dm_allowed && !broadcast_allowed {
            debug!(
                assignment_id = assignment.id,
                "non-primary duplicate, delivery skipped"
            );
            report.skipped_non_primary = true;
            return Ok(report);
        }

        if dm_allowed {
            self.fanout_dms(assignment, &mut report).await?;
        }
        if broadcast_allowed {
            self.broadcast(assignment, &mut report).await?;
        }

        info!(
            assignment_id = assignment.id,
            dms_sent = report.dms_sent,
            dms_deduped = report.dms_deduped,
            dms_throttled = report.dms_throttled,
            broadcast_sent = report.broadcast_sent,
            "fanout complete"
        );
        Ok(report)
    }

    async fn fanout_dms(
        &self,
        assignment: &Assignment,
        report: &mut DeliveryReport,
    ) -> Result<(), DeliveryError> {
        let tutors = self
            .store
            .active_tutors()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        for profile in tutors {
            let Some(matched) = tutor_matches(
                &profile,
                assignment,
                self.config.dm_max_distance_km_default,
            ) else {
                continue;
            };

            if self.gated_by_rating_threshold(&profile, assignment, matched.distance_km).await {
                report.dms_gated += 1;
                continue;
            }

            if !self.dm_limiter.try_acquire(&profile.id.to_string()) {
                report.dms_throttled += 1;
                continue;
            }

            let newly_marked = self
                .store
                .mark_dm_sent(profile.id, assignment.id)
                .await
                .map_err(|e| DeliveryError::Transport(e.to_string()))?;
            if !newly_marked {
                report.dms_deduped += 1;
                continue;
            }

            let content = render_dm(assignment, matched.distance_km);
            let key = format!("dm:{}:{}", profile.id, assignment.id);
            match self.transport.send_dm(&profile.chat_id, &content, &key).await {
                Ok(_) => report.dms_sent += 1,
                Err(e) => {
                    report.dms_failed += 1;
                    warn!(
                        tutor_id = profile.id,
                        assignment_id = assignment.id,
                        error = %e,
                        "DM send failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// The adaptive gate: skip when the predicted rating falls below the
    /// tutor's historical percentile threshold.
    async fn gated_by_rating_threshold(
        &self,
        profile: &tutorflow_model::TutorProfile,
        assignment: &Assignment,
        distance_km: Option<f64>,
    ) -> bool {
        let Some(percentile) = profile.rating_threshold_percentile else {
            return false;
        };
        if percentile <= 0.0 {
            return false;
        }
        let threshold = match self
            .store
            .tutor_rating_threshold(profile.id, percentile)
            .await
        {
            Ok(Some(threshold)) => threshold,
            // No history or store hiccup: never gate silently.
            Ok(None) | Err(_) => return false,
        };
        let avg_rate = self.store.tutor_avg_rate(profile.id).await.ok().flatten();
        let pays_at_least_average = match (avg_rate, assignment.rate_range()) {
            (Some(avg), Some((_, max))) => max as f64 >= avg,
            _ => true,
        };
        predict_rating(distance_km, pays_at_least_average) < threshold
    }

    async fn broadcast(
        &self,
        assignment: &Assignment,
        report: &mut DeliveryReport,
    ) -> Result<(), DeliveryError> {
        if !self.broadcast_limiter.try_acquire(&self.broadcast_channel) {
            // Saturated channel: drop this post, DMs already went out.
            report.broadcast_throttled = true;
            warn!(
                assignment_id = assignment.id,
                channel = %self.broadcast_channel,
                "broadcast throttled"
            );
            return Ok(());
        }

        let duplicate_note = if self.config.broadcast_duplicate_mode
            == BroadcastDuplicateMode::PrimaryWithNote
            && let Some(group_id) = assignment.duplicate_group_id
            && let Ok(Some(group)) = self.store.get_group(group_id).await
            && group.member_count > 1
        {
            Some(format!("Also posted by {} agencies", group.member_count))
        } else {
            None
        };

        let clicks = self
            .store
            .get_clicks(&assignment.external_id)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?
            .map_or(0, |c| c.click_count);
        let content = render_broadcast(assignment, clicks, duplicate_note.as_deref());

        let existing = self
            .store
            .get_broadcast(&assignment.external_id)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        let edit_target = existing.as_ref().map(|b| b.message_id.as_str());

        match self
            .transport
            .broadcast(&self.broadcast_channel, &content, edit_target)
            .await
        {
            Ok(message_id) => {
                self.store
                    .record_broadcast(BroadcastRecord {
                        external_id: assignment.external_id.clone(),
                        channel: self.broadcast_channel.clone(),
                        message_id,
                        content,
                        updated_at: chrono::Utc::now(),
                    })
                    .await
                    .map_err(|e| DeliveryError::Transport(e.to_string()))?;
                report.broadcast_sent = true;
            }
            Err(e) => {
                warn!(
                    assignment_id = assignment.id,
                    error = %e,
                    "broadcast send failed"
                );
            }
        }
        Ok(())
    }

    /// Register clicks and edit the broadcast post when the displayed
    /// bucket changed. Returns the new click count.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError` on store failures; the click increment
    /// itself is atomic in the store.
    pub async fn handle_click(
        &self,
        assignment: &Assignment,
        original_url: Option<&str>,
        delta: i64,
    ) -> Result<i64, DeliveryError> {
        let before = self
            .store
            .get_clicks(&assignment.external_id)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?
            .map_or(0, |c| c.click_count);
        let after = self
            .store
            .increment_clicks(&assignment.external_id, original_url, delta)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        if click_bucket(before) != click_bucket(after)
            && let Some(existing) = self
                .store
                .get_broadcast(&assignment.external_id)
                .await
                .map_err(|e| DeliveryError::Transport(e.to_string()))?
        {
            let content = render_broadcast(assignment, after, None);
            match self
                .transport
                .broadcast(&existing.channel, &content, Some(&existing.message_id))
                .await
            {
                Ok(message_id) => {
                    self.store
                        .record_broadcast(BroadcastRecord {
                            external_id: assignment.external_id.clone(),
                            channel: existing.channel,
                            message_id,
                            content,
                            updated_at: chrono::Utc::now(),
                        })
                        .await
                        .map_err(|e| DeliveryError::Transport(e.to_string()))?;
                }
                Err(e) => {
                    warn!(
                        external_id = %assignment.external_id,
                        error = %e,
                        "broadcast edit failed"
                    );
                }
            }
        }
        Ok(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tutorflow_model::{AssignmentDraft, TutorProfile};
    use tutorflow_store::MemoryStore;

    fn draft(agency: &str, external: &str) -> AssignmentDraft {
        AssignmentDraft {
            agency_id: agency.to_string(),
            external_id: external.to_string(),
            assignment_code: None,
            message_link: Some("https://t.me/acme/100".into()),
            academic_display_text: Some("Sec 3 Math".into()),
            lesson_schedule: vec!["Mon 7-9pm".into()],
            start_date: None,
            time_availability_note: None,
            tutor_types: vec![],
            rate_raw_text: Some("$40/hr".into()),
            rate_breakdown: None,
            learning_mode: None,
            address: vec!["Tampines".into()],
            postal_code: vec!["520123".into()],
            postal_code_estimated: vec![],
            postal_lat: Some(1.3530),
            postal_lon: Some(103.9440),
            postal_coords_estimated: false,
            region: None,
            nearest_mrt_computed: Some("Tampines".into()),
            nearest_mrt_computed_line: Some("EW".into()),
            nearest_mrt_computed_distance_m: Some(400),
            rate_min: Some(40),
            rate_max: Some(40),
            signals_subjects: vec!["Math".into()],
            signals_levels: vec!["Secondary".into()],
            signals_specific_student_levels: vec!["Sec 3".into()],
            subjects_canonical: vec!["MATH.SEC_EMATH".into()],
            subjects_general: vec!["MATH".into()],
            canonicalization_version: 3,
            published_at: Some(Utc::now()),
            source_last_seen: Some(Utc::now()),
        }
    }

    fn tutor(id: i64) -> TutorProfile {
        TutorProfile {
            id,
            chat_id: format!("chat-{id}"),
            subjects: vec!["MATH.SEC_EMATH".into()],
            levels: vec!["Secondary".into()],
            home_lat: Some(1.3536),
            home_lon: Some(103.9452),
            max_distance_km: Some(10.0),
            rating_threshold_percentile: None,
            active: true,
        }
    }

    fn service(
        store: Arc<MemoryStore>,
        transport: Arc<RecordingTransport>,
    ) -> DeliveryService {
        DeliveryService::new(store, transport, DeliveryConfig::default(), "feed")
    }

    #[tokio::test]
    async fn test_fanout_sends_dm_and_broadcast() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        store.upsert_tutor(tutor(1)).await.unwrap();
        let a = store.upsert_assignment(draft("acme", "a-1")).await.unwrap();

        let svc = service(Arc::clone(&store), Arc::clone(&transport));
        let report = svc.fanout(&a).await.unwrap();
        assert_eq!(report.dms_sent, 1);
        assert!(report.broadcast_sent);

        let dms = transport.sent_dms();
        assert_eq!(dms.len(), 1);
        assert_eq!(dms[0].chat_id, "chat-1");
        assert!(dms[0].content.contains("Sec 3 Math"));

        // Broadcast record stored for later edit-on-click
        assert!(store.get_broadcast("a-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fanout_dedupes_repeat_delivery() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        store.upsert_tutor(tutor(1)).await.unwrap();
        let a = store.upsert_assignment(draft("acme", "a-1")).await.unwrap();

        let svc = service(Arc::clone(&store), Arc::clone(&transport));
        svc.fanout(&a).await.unwrap();
        let second = svc.fanout(&a).await.unwrap();
        assert_eq!(second.dms_sent, 0);
        assert_eq!(second.dms_deduped, 1);
        assert_eq!(transport.sent_dms().len(), 1);
    }

    #[tokio::test]
    async fn test_non_primary_skipped() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        store.upsert_tutor(tutor(1)).await.unwrap();
        let mut a = store.upsert_assignment(draft("acme", "a-1")).await.unwrap();
        a.is_primary_in_group = false;
        a.duplicate_group_id = Some(1);

        let svc = service(Arc::clone(&store), Arc::clone(&transport));
        let report = svc.fanout(&a).await.unwrap();
        assert!(report.skipped_non_primary);
        assert!(transport.sent_dms().is_empty());
        assert!(transport.sent_broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_non_matching_tutor_not_dmed() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let mut t = tutor(1);
        t.subjects = vec!["ENG.PRI".into()];
        store.upsert_tutor(t).await.unwrap();
        let a = store.upsert_assignment(draft("acme", "a-1")).await.unwrap();

        let svc = service(Arc::clone(&store), Arc::clone(&transport));
        let report = svc.fanout(&a).await.unwrap();
        assert_eq!(report.dms_sent, 0);
        assert!(transport.sent_dms().is_empty());
    }

    #[tokio::test]
    async fn test_click_bucket_edit() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let a = store.upsert_assignment(draft("acme", "a-1")).await.unwrap();
        let svc = service(Arc::clone(&store), Arc::clone(&transport));
        svc.fanout(&a).await.unwrap();
        assert_eq!(transport.sent_broadcasts().len(), 1);

        // 4 clicks stay in bucket 0: no edit
        svc.handle_click(&a, None, 4).await.unwrap();
        assert_eq!(transport.sent_broadcasts().len(), 1);

        // Crossing 5 triggers an edit of the original post
        svc.handle_click(&a, None, 1).await.unwrap();
        let broadcasts = transport.sent_broadcasts();
        assert_eq!(broadcasts.len(), 2);
        assert!(broadcasts[1].edit_target.is_some());
        assert!(broadcasts[1].content.contains("5+"));
    }

    #[tokio::test]
    async fn test_rating_threshold_gates() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let mut t = tutor(1);
        t.rating_threshold_percentile = Some(50.0);
        store.upsert_tutor(t).await.unwrap();
        let a = store.upsert_assignment(draft("acme", "a-1")).await.unwrap();

        // History of perfect ratings: the median (5.0) exceeds any
        // prediction, so the gate fires.
        for i in 0..4 {
            store
                .record_rating(tutorflow_model::TutorRating {
                    tutor_id: 1,
                    assignment_id: 100 + i,
                    rating: 5.0,
                    distance_km_at_send: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let svc = service(Arc::clone(&store), Arc::clone(&transport));
        let report = svc.fanout(&a).await.unwrap();
        assert_eq!(report.dms_gated, 1);
        assert_eq!(report.dms_sent, 0);
    }
}
