//! Weighted multi-signal similarity scoring
//!
//! Each signal scores in [0, 1]; the weighted sum is clamped to [0, 100].
//! Weights ship with the empirically tuned defaults and are overridable via
//! `[dedup]` configuration.

use chrono::Duration;

use tutorflow_config::DedupWeights;
use tutorflow_enrich::lexically_overlapping;
use tutorflow_model::Assignment;

/// Per-signal breakdown of one pairwise comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreBreakdown {
    pub postal: f64,
    pub subjects: f64,
    pub levels: f64,
    pub rate: f64,
    pub assignment_code: f64,
    pub temporal: f64,
    pub time_availability: f64,
    /// Weighted sum, clamped to [0, 100].
    pub total: f64,
}

/// Score candidate `c` against the new assignment `a`.
#[must_use]
pub fn score_pair(
    a: &Assignment,
    c: &Assignment,
    weights: &DedupWeights,
    fuzzy_postal_tolerance: usize,
) -> ScoreBreakdown {
    let postal = postal_score(&a.postal_code, &c.postal_code, fuzzy_postal_tolerance);
    let subjects = subjects_score(a, c);
    let levels = jaccard(&a.all_level_signals(), &c.all_level_signals());
    let rate = rate_score(a, c);
    let assignment_code = code_score(a.assignment_code.as_deref(), c.assignment_code.as_deref());
    let temporal = temporal_score(a, c);
    let time_availability = availability_score(a, c);

    let total = (postal * weights.postal
        + subjects * weights.subjects
        + levels * weights.levels
        + rate * weights.rate
        + assignment_code * weights.assignment_code
        + temporal * weights.temporal
        + time_availability * weights.time_availability)
        .clamp(0.0, 100.0);

    ScoreBreakdown {
        postal,
        subjects,
        levels,
        rate,
        assignment_code,
        temporal,
        time_availability,
        total,
    }
}

/// Exact six-digit match scores 1.0; a fuzzy match (same first two digits,
/// at most `tolerance` differing digits) scores 0.85.
fn postal_score(a: &[String], c: &[String], tolerance: usize) -> f64 {
    let mut best: f64 = 0.0;
    for pa in a {
        for pc in c {
            if pa == pc {
                return 1.0;
            }
            if fuzzy_postal_match(pa, pc, tolerance) {
                best = best.max(0.85);
            }
        }
    }
    best
}

fn fuzzy_postal_match(a: &str, b: &str, tolerance: usize) -> bool {
    if a.len() != 6 || b.len() != 6 || !a.is_ascii() || !b.is_ascii() || a[..2] != b[..2] {
        return false;
    }
    let differing = a
        .chars()
        .zip(b.chars())
        .filter(|(x, y)| x != y)
        .count();
    differing <= tolerance
}

/// Jaccard over canonical subjects, falling back to raw subject signals
/// when either side has no canonical codes.
fn subjects_score(a: &Assignment, c: &Assignment) -> f64 {
    if !a.subjects_canonical.is_empty() && !c.subjects_canonical.is_empty() {
        jaccard(&a.subjects_canonical, &c.subjects_canonical)
    } else {
        jaccard(&a.signals_subjects, &c.signals_subjects)
    }
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a
        .iter()
        .filter(|x| b.iter().any(|y| y.eq_ignore_ascii_case(x)))
        .count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// 1 when the rate ranges intersect, else 0. Missing numerics on either
/// side score 0 rather than guessing.
fn rate_score(a: &Assignment, c: &Assignment) -> f64 {
    match (a.rate_range(), c.rate_range()) {
        (Some((a_min, a_max)), Some((c_min, c_max))) => {
            if a_min <= c_max && c_min <= a_max {
                1.0
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

/// Strip common agency prefixes and uppercase.
fn normalize_code(code: &str) -> String {
    let upper = code.trim().to_ascii_uppercase();
    let stripped = upper
        .trim_start_matches('#')
        .trim_start_matches("TA-")
        .trim_start_matches("TA")
        .trim_start_matches("REF-")
        .trim_start_matches("REF")
        .trim_start_matches("CODE-")
        .trim_start_matches("JOB-")
        .trim_start_matches(['-', ':', ' ']);
    stripped.to_string()
}

/// Exact normalized match scores 1.0, prefix match 0.75.
fn code_score(a: Option<&str>, c: Option<&str>) -> f64 {
    let (Some(a), Some(c)) = (a, c) else {
        return 0.0;
    };
    let na = normalize_code(a);
    let nc = normalize_code(c);
    if na.is_empty() || nc.is_empty() {
        return 0.0;
    }
    if na == nc {
        return 1.0;
    }
    // Prefix matches need enough shared signal to mean anything
    let shorter = na.len().min(nc.len());
    if shorter >= 3 && (na.starts_with(&nc) || nc.starts_with(&na)) {
        return 0.75;
    }
    0.0
}

/// 1 within 48h of each other, 0.6 within 96h, else 0.
fn temporal_score(a: &Assignment, c: &Assignment) -> f64 {
    let (Some(pa), Some(pc)) = (a.published_at, c.published_at) else {
        return 0.0;
    };
    let gap = (pa - pc).abs();
    if gap <= Duration::hours(48) {
        1.0
    } else if gap <= Duration::hours(96) {
        0.6
    } else {
        0.0
    }
}

/// 1 when both notes are present and lexically overlapping.
fn availability_score(a: &Assignment, c: &Assignment) -> f64 {
    match (
        a.time_availability_note.as_deref(),
        c.time_availability_note.as_deref(),
    ) {
        (Some(na), Some(nc)) if lexically_overlapping(na, nc) => 1.0,
        _ => 0.0,
    }
}
