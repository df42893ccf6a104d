//! Deterministic enrichers
//!
//! Pure functions over the extracted payload and the raw post text. Every
//! enricher is idempotent: re-running on its own output is bit-identical.
//! Nothing here touches the LLM; signal rollups in particular exist so that
//! filtering keeps working even when extraction misfires.

pub mod canonical;
pub mod geo;
pub mod rate;
pub mod schedule;
pub mod signals;

use tutorflow_model::ExtractedPayload;

pub use canonical::{CANONICALIZATION_VERSION, CanonicalSubjects, canonicalize};
pub use geo::{GeoResolution, haversine_km, resolve_postal};
pub use rate::parse_rate_range;
pub use schedule::{availability_tokens, lexically_overlapping};
pub use signals::{SignalRollup, rollup_signals};

/// Everything the deterministic pass adds on top of an extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    /// Resolved from the first valid six-digit postal code, confirmed ones
    /// taking precedence over estimated ones.
    pub geo: Option<GeoResolution>,
    /// True when the geo resolution came from an estimated postal only.
    pub coords_estimated: bool,
    pub canonical: CanonicalSubjects,
    pub signals: SignalRollup,
    /// Filled only when the LLM supplied no numerics.
    pub rate_min: Option<i64>,
    pub rate_max: Option<i64>,
    pub canonicalization_version: i32,
}

/// Run the full enricher chain.
///
/// Signal rollups come from the raw text alone; canonicalization sees both
/// the payload subjects and the rolled-up signals so a missed LLM subject
/// still canonicalizes.
#[must_use]
pub fn enrich(payload: &ExtractedPayload, raw_text: &str) -> Enrichment {
    let signals = rollup_signals(raw_text);

    let (geo, coords_estimated) = resolve_first_postal(payload);

    let mut subject_labels = payload.subjects.clone();
    for s in &signals.subjects {
        if !subject_labels.iter().any(|x| x.eq_ignore_ascii_case(s)) {
            subject_labels.push(s.clone());
        }
    }
    let mut level_hints = payload.levels.clone();
    for l in &signals.levels {
        if !level_hints.iter().any(|x| x.eq_ignore_ascii_case(l)) {
            level_hints.push(l.clone());
        }
    }
    let canonical = canonicalize(&level_hints, &subject_labels);

    let (rate_min, rate_max) = match (payload.rate_min, payload.rate_max) {
        (None, None) => {
            let span = payload.rate_raw_text.as_deref().unwrap_or(raw_text);
            parse_rate_range(span).map_or((None, None), |(lo, hi)| (Some(lo), Some(hi)))
        }
        (min, max) => (min.or(max), max.or(min)),
    };

    Enrichment {
        geo,
        coords_estimated,
        canonical,
        signals,
        rate_min,
        rate_max,
        canonicalization_version: CANONICALIZATION_VERSION,
    }
}

/// First valid postal wins; confirmed codes outrank estimated ones.
fn resolve_first_postal(payload: &ExtractedPayload) -> (Option<GeoResolution>, bool) {
    for code in &payload.postal_code {
        if let Some(geo) = resolve_postal(code) {
            return (Some(geo), false);
        }
    }
    for code in &payload.postal_code_estimated {
        if let Some(geo) = resolve_postal(code) {
            return (Some(geo), true);
        }
    }
    (None, false)
}
