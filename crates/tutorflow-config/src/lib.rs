//! Configuration management for tutorflow
//!
//! Hierarchical configuration with precedence: CLI flags > environment >
//! config file > defaults. TOML sections mirror the subsystems:
//! `[worker]`, `[llm]`, `[dedup]`, `[freshness]`, `[delivery]`, `[store]`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tutorflow_utils::error::ConfigError;

/// Default logical identity of the extraction schema + model.
pub const DEFAULT_PIPELINE_VERSION: &str = "v1";

fn default_pipeline_version() -> String {
    DEFAULT_PIPELINE_VERSION.to_string()
}

/// Worker pool and queue lease settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent worker tasks. Bounded by LLM upstream concurrency.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Jobs claimed per batch; processed sequentially inside one worker.
    #[serde(default = "default_claim_batch_size")]
    pub claim_batch_size: usize,
    /// Wall-clock budget per job in seconds.
    #[serde(default = "default_job_timeout_s")]
    pub job_wall_clock_timeout_s: u64,
    /// Age after which a `processing` job is considered abandoned.
    #[serde(default = "default_stale_requeue_s")]
    pub stale_requeue_s: u64,
    /// Retry cap; a job exceeding it stays failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Shutdown drain deadline in seconds.
    #[serde(default = "default_drain_deadline_s")]
    pub drain_deadline_s: u64,
}

fn default_worker_count() -> usize {
    4
}
fn default_claim_batch_size() -> usize {
    8
}
fn default_job_timeout_s() -> u64 {
    120
}
fn default_stale_requeue_s() -> u64 {
    300
}
fn default_max_attempts() -> u32 {
    5
}
fn default_drain_deadline_s() -> u64 {
    30
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            claim_batch_size: default_claim_batch_size(),
            job_wall_clock_timeout_s: default_job_timeout_s(),
            stale_requeue_s: default_stale_requeue_s(),
            max_attempts: default_max_attempts(),
            drain_deadline_s: default_drain_deadline_s(),
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_wall_clock_timeout_s)
    }

    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_requeue_s)
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Sliding window length in calls.
    #[serde(default = "default_breaker_window")]
    pub window: usize,
    /// Failure ratio in [0, 1] that trips the breaker.
    #[serde(default = "default_breaker_failure_ratio")]
    pub failure_ratio: f64,
    /// Minimum calls in the window before the ratio is meaningful.
    #[serde(default = "default_breaker_min_calls")]
    pub min_calls: usize,
    /// Seconds an open breaker waits before admitting the half-open probe.
    #[serde(default = "default_breaker_cooldown_s")]
    pub open_cooldown_s: u64,
}

fn default_breaker_window() -> usize {
    10
}
fn default_breaker_failure_ratio() -> f64 {
    0.5
}
fn default_breaker_min_calls() -> usize {
    5
}
fn default_breaker_cooldown_s() -> u64 {
    30
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: default_breaker_window(),
            failure_ratio: default_breaker_failure_ratio(),
            min_calls: default_breaker_min_calls(),
            open_cooldown_s: default_breaker_cooldown_s(),
        }
    }
}

/// LLM backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_llm_timeout_s")]
    pub llm_timeout_s: u64,
    /// Transient retries per invocation (network/5xx/429).
    #[serde(default = "default_llm_max_retries")]
    pub llm_max_retries: u32,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Override for the Messages API endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_llm_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_llm_timeout_s() -> u64 {
    60
}
fn default_llm_max_retries() -> u32 {
    3
}
fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            llm_model: default_llm_model(),
            llm_timeout_s: default_llm_timeout_s(),
            llm_max_retries: default_llm_max_retries(),
            api_key_env: default_api_key_env(),
            base_url: None,
            breaker: BreakerConfig::default(),
        }
    }
}

impl LlmConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_s)
    }
}

/// Per-signal weights for duplicate scoring. The defaults are the
/// empirically tuned set; every value is overridable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupWeights {
    #[serde(default = "default_w_postal")]
    pub postal: f64,
    #[serde(default = "default_w_subjects")]
    pub subjects: f64,
    #[serde(default = "default_w_levels")]
    pub levels: f64,
    #[serde(default = "default_w_rate")]
    pub rate: f64,
    #[serde(default = "default_w_code")]
    pub assignment_code: f64,
    #[serde(default = "default_w_temporal")]
    pub temporal: f64,
    #[serde(default = "default_w_availability")]
    pub time_availability: f64,
}

fn default_w_postal() -> f64 {
    50.0
}
fn default_w_subjects() -> f64 {
    35.0
}
fn default_w_levels() -> f64 {
    25.0
}
fn default_w_rate() -> f64 {
    15.0
}
fn default_w_code() -> f64 {
    10.0
}
fn default_w_temporal() -> f64 {
    10.0
}
fn default_w_availability() -> f64 {
    5.0
}

impl Default for DedupWeights {
    fn default() -> Self {
        Self {
            postal: default_w_postal(),
            subjects: default_w_subjects(),
            levels: default_w_levels(),
            rate: default_w_rate(),
            assignment_code: default_w_code(),
            temporal: default_w_temporal(),
            time_availability: default_w_availability(),
        }
    }
}

/// Duplicate detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Linking threshold; only scores at or above it create links.
    #[serde(default = "default_dup_threshold")]
    pub dup_threshold: f64,
    #[serde(default)]
    pub dup_weights: DedupWeights,
    /// Candidate window in days over `published_at`.
    #[serde(default = "default_dup_window_days")]
    pub dup_time_window_days: i64,
    /// Candidate cap per detection.
    #[serde(default = "default_dup_batch_size")]
    pub dup_batch_size: usize,
    /// Max differing digits for the fuzzy postal match.
    #[serde(default = "default_dup_fuzzy_postal")]
    pub dup_fuzzy_postal_tolerance: usize,
}

fn default_dup_threshold() -> f64 {
    70.0
}
fn default_dup_window_days() -> i64 {
    7
}
fn default_dup_batch_size() -> usize {
    50
}
fn default_dup_fuzzy_postal() -> usize {
    2
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            dup_threshold: default_dup_threshold(),
            dup_weights: DedupWeights::default(),
            dup_time_window_days: default_dup_window_days(),
            dup_batch_size: default_dup_batch_size(),
            dup_fuzzy_postal_tolerance: default_dup_fuzzy_postal(),
        }
    }
}

/// Freshness tier thresholds, as hours of `source_last_seen` age.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessConfig {
    #[serde(default = "default_green_h")]
    pub green_max_hours: i64,
    #[serde(default = "default_yellow_h")]
    pub yellow_max_hours: i64,
    #[serde(default = "default_orange_h")]
    pub orange_max_hours: i64,
    /// Rows updated per batch.
    #[serde(default = "default_freshness_batch")]
    pub batch_size: usize,
    /// Recompute period in seconds.
    #[serde(default = "default_freshness_period_s")]
    pub period_s: u64,
}

fn default_green_h() -> i64 {
    24
}
fn default_yellow_h() -> i64 {
    72
}
fn default_orange_h() -> i64 {
    168
}
fn default_freshness_batch() -> usize {
    500
}
fn default_freshness_period_s() -> u64 {
    900
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            green_max_hours: default_green_h(),
            yellow_max_hours: default_yellow_h(),
            orange_max_hours: default_orange_h(),
            batch_size: default_freshness_batch(),
            period_s: default_freshness_period_s(),
        }
    }
}

/// How broadcast treats duplicate-group members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastDuplicateMode {
    /// Broadcast every member.
    All,
    /// Broadcast only the group primary.
    #[default]
    PrimaryOnly,
    /// Broadcast the primary with a "also posted by N agencies" note.
    PrimaryWithNote,
}

/// Delivery fanout settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub broadcast_duplicate_mode: BroadcastDuplicateMode,
    /// Skip DMs entirely for non-primary duplicates.
    #[serde(default = "default_dm_skip_duplicates")]
    pub dm_skip_duplicates: bool,
    /// Distance cap when a tutor profile has none.
    #[serde(default = "default_dm_max_distance_km")]
    pub dm_max_distance_km_default: f64,
    /// DMs per tutor per minute.
    #[serde(default = "default_dm_rate_per_min")]
    pub dm_rate_per_minute: u32,
    /// Broadcasts per channel per minute.
    #[serde(default = "default_broadcast_rate_per_min")]
    pub broadcast_rate_per_minute: u32,
}

fn default_dm_skip_duplicates() -> bool {
    true
}
fn default_dm_max_distance_km() -> f64 {
    12.0
}
fn default_dm_rate_per_min() -> u32 {
    20
}
fn default_broadcast_rate_per_min() -> u32 {
    20
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            broadcast_duplicate_mode: BroadcastDuplicateMode::default(),
            dm_skip_duplicates: default_dm_skip_duplicates(),
            dm_max_distance_km_default: default_dm_max_distance_km(),
            dm_rate_per_minute: default_dm_rate_per_min(),
            broadcast_rate_per_minute: default_broadcast_rate_per_min(),
        }
    }
}

/// Store connection settings. The database URL comes from the environment
/// only; it never lives in a config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Environment variable holding the Postgres URL.
    #[serde(default = "default_database_url_env")]
    pub database_url_env: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_database_url_env() -> String {
    "DATABASE_URL".to_string()
}
fn default_pool_size() -> u32 {
    8
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url_env: default_database_url_env(),
            pool_size: default_pool_size(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default = "default_pipeline_version")]
    pub pipeline_version: String,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub freshness: FreshnessConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Per-agency extraction hints keyed by agency id.
    #[serde(default)]
    pub agencies: HashMap<String, AgencySection>,
}

/// Per-agency section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AgencySection {
    #[serde(default)]
    pub code_prefixes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_note: Option<String>,
}

impl Config {
    /// Load from a TOML file, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NotFound` when the path does not exist,
    /// `ConfigError::Parse` on malformed TOML, and `ConfigError::
    /// InvalidValue` when a setting fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|_| ConfigError::NotFound {
            path: path.display().to_string(),
        })?;
        let mut config: Self = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` when an override fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            pipeline_version: default_pipeline_version(),
            ..Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides recognized at load time.
    ///
    /// `TUTORFLOW_PIPELINE_VERSION`, `TUTORFLOW_WORKER_COUNT`,
    /// `TUTORFLOW_LLM_MODEL` cover the values that vary per deployment
    /// without editing the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TUTORFLOW_PIPELINE_VERSION")
            && !v.is_empty()
        {
            self.pipeline_version = v;
        }
        if let Ok(v) = std::env::var("TUTORFLOW_WORKER_COUNT")
            && let Ok(n) = v.parse::<usize>()
        {
            self.worker.worker_count = n;
        }
        if let Ok(v) = std::env::var("TUTORFLOW_LLM_MODEL")
            && !v.is_empty()
        {
            self.llm.llm_model = v;
        }
    }

    /// Reject values that would wedge the pipeline.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline_version.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "pipeline_version".into(),
            });
        }
        if self.worker.worker_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "worker.worker_count".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.worker.claim_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "worker.claim_batch_size".into(),
                reason: "must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.llm.breaker.failure_ratio) {
            return Err(ConfigError::InvalidValue {
                key: "llm.breaker.failure_ratio".into(),
                reason: "must be within [0, 1]".into(),
            });
        }
        if self.dedup.dup_threshold < 0.0 || self.dedup.dup_threshold > 100.0 {
            return Err(ConfigError::InvalidValue {
                key: "dedup.dup_threshold".into(),
                reason: "must be within [0, 100]".into(),
            });
        }
        if self.freshness.green_max_hours >= self.freshness.yellow_max_hours
            || self.freshness.yellow_max_hours >= self.freshness.orange_max_hours
        {
            return Err(ConfigError::InvalidValue {
                key: "freshness".into(),
                reason: "tier thresholds must be strictly increasing".into(),
            });
        }
        Ok(())
    }

    /// Small known-good config for unit tests.
    #[must_use]
    pub fn minimal_for_testing() -> Self {
        Self {
            pipeline_version: "test-v1".into(),
            worker: WorkerConfig {
                worker_count: 1,
                claim_batch_size: 2,
                job_wall_clock_timeout_s: 5,
                stale_requeue_s: 5,
                max_attempts: 3,
                drain_deadline_s: 2,
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_pass_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker.worker_count, 4);
        assert_eq!(config.dedup.dup_weights.postal, 50.0);
        assert_eq!(config.dedup.dup_threshold, 70.0);
        assert_eq!(config.freshness.green_max_hours, 24);
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
pipeline_version = "v7"

[worker]
worker_count = 2

[dedup.dup_weights]
postal = 40.0
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.pipeline_version, "v7");
        assert_eq!(config.worker.worker_count, 2);
        // Untouched worker fields keep defaults
        assert_eq!(config.worker.claim_batch_size, 8);
        // Overridden weight, others default
        assert_eq!(config.dedup.dup_weights.postal, 40.0);
        assert_eq!(config.dedup.dup_weights.subjects, 35.0);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/tutorflow.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_invalid_worker_count_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[worker]\nworker_count = 0").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "worker.worker_count"));
    }

    #[test]
    fn test_broadcast_mode_wire_names() {
        let mode: BroadcastDuplicateMode =
            serde_json::from_str("\"primary_with_note\"").unwrap();
        assert_eq!(mode, BroadcastDuplicateMode::PrimaryWithNote);
    }

    #[test]
    fn test_nonmonotonic_freshness_rejected() {
        let mut config = Config::default();
        config.freshness.yellow_max_hours = 10;
        assert!(config.validate().is_err());
    }
}
