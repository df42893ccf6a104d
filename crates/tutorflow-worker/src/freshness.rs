//! Freshness tiering: recompute open-likelihood tiers from bump recency

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use tutorflow_config::FreshnessConfig;
use tutorflow_model::{Assignment, FreshnessTier};
use tutorflow_store::Store;
use tutorflow_utils::error::StoreError;

/// Tier for a given activity age.
#[must_use]
pub fn tier_for_age_hours(age_hours: i64, config: &FreshnessConfig) -> FreshnessTier {
    if age_hours <= config.green_max_hours {
        FreshnessTier::Green
    } else if age_hours <= config.yellow_max_hours {
        FreshnessTier::Yellow
    } else if age_hours <= config.orange_max_hours {
        FreshnessTier::Orange
    } else {
        FreshnessTier::Red
    }
}

/// Activity timestamp the tier is computed from: last upstream bump,
/// falling back to publish time, then first-seen.
fn activity_ts(a: &Assignment) -> DateTime<Utc> {
    a.source_last_seen
        .or(a.published_at)
        .unwrap_or(a.created_at)
}

/// One full retier sweep over open assignments, in bounded batches.
/// Returns the number of rows whose tier changed.
///
/// # Errors
///
/// Returns the first store error; a partial sweep is fine, the next run
/// catches up.
pub async fn retier_open_assignments(
    store: &dyn Store,
    config: &FreshnessConfig,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let mut changed = 0u64;
    let mut after_id = 0i64;
    loop {
        let batch = store
            .open_assignments_after(after_id, config.batch_size)
            .await?;
        if batch.is_empty() {
            break;
        }
        after_id = batch.last().map(|a| a.id).unwrap_or(after_id);
        let updates: Vec<(i64, FreshnessTier)> = batch
            .iter()
            .filter_map(|a| {
                let age_hours = (now - activity_ts(a)).num_hours();
                let tier = tier_for_age_hours(age_hours, config);
                (tier != a.freshness_tier).then_some((a.id, tier))
            })
            .collect();
        if !updates.is_empty() {
            changed += store.set_freshness_tiers(&updates).await?;
        }
    }
    Ok(changed)
}

/// Periodic tiering job; runs until shutdown.
pub async fn run_periodic(
    store: Arc<dyn Store>,
    config: FreshnessConfig,
    shutdown: watch::Receiver<bool>,
) {
    let period = Duration::from_secs(config.period_s.max(1));
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::time::sleep(period).await;
        if *shutdown.borrow() {
            break;
        }
        match retier_open_assignments(store.as_ref(), &config, Utc::now()).await {
            Ok(0) => {}
            Ok(n) => info!(retiered = n, "freshness sweep updated tiers"),
            Err(e) => error!(error = %e, "freshness sweep failed"),
        }
    }
}
