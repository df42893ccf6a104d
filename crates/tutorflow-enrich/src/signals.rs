//! Deterministic signal rollups from raw post text
//!
//! Filtering must keep working even when LLM extraction misfires, so the
//! level, specific-level, and subject signals are rolled up from the raw
//! text with plain tokenizers, independent of the model output.

use regex::Regex;
use std::sync::LazyLock;

/// Deduplicated signal arrays in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalRollup {
    /// Level keywords: `Primary`, `Secondary`, `JC`, `IB`, `IGCSE`.
    pub levels: Vec<String>,
    /// Normalized specific student levels: `Sec 3`, `P5`, `JC1`, ...
    pub specific_student_levels: Vec<String>,
    /// Subject mentions, title-cased as listed in the lexicon.
    pub subjects: Vec<String>,
}

/// Specific-level patterns; group 1 captures the digit.
static SEC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bsec(?:ondary)?\.?\s*([1-5])\b").unwrap());
static PRI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:p|pri(?:mary)?\.?\s*)([1-6])\b").unwrap());
static JC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:jc|j)\s*([1-2])\b").unwrap());

/// Level keyword lexicon: canonical form plus lowercase needles.
static LEVEL_KEYWORDS: &[(&str, &[&str])] = &[
    ("Primary", &["primary", "pri ", "psle"]),
    ("Secondary", &["secondary", "sec ", "sec.", "o level", "o-level", "olevel", "n level", "n-level"]),
    ("JC", &["jc", "junior college", "a level", "a-level", "alevel", "h1 ", "h2 "]),
    ("IB", &["ib ", " ib", "international baccalaureate", "myp", "ib-"]),
    ("IGCSE", &["igcse"]),
];

/// Subject lexicon: display form plus lowercase needles. Longer phrases
/// first so `a math` wins over `math`.
static SUBJECT_KEYWORDS: &[(&str, &[&str])] = &[
    ("A Math", &["a math", "amath", "a-math", "additional math", "add math"]),
    ("E Math", &["e math", "emath", "e-math", "elementary math"]),
    ("General Paper", &["general paper", " gp ", " gp,", " gp."]),
    ("Social Studies", &["social studies"]),
    ("POA", &["principles of accounts", "poa"]),
    ("Higher Chinese", &["higher chinese", "hcl"]),
    ("Math", &["math", "maths", "mathematics"]),
    ("English", &["english"]),
    ("Science", &["science"]),
    ("Physics", &["physics", "phy "]),
    ("Chemistry", &["chemistry", "chem"]),
    ("Biology", &["biology", " bio "]),
    ("Chinese", &["chinese", "mandarin"]),
    ("Malay", &["malay"]),
    ("Tamil", &["tamil"]),
    ("History", &["history"]),
    ("Geography", &["geography", "geog"]),
    ("Literature", &["literature", " lit "]),
    ("Economics", &["economics", "econs"]),
];

fn push_unique(out: &mut Vec<String>, value: String) {
    if !out.contains(&value) {
        out.push(value);
    }
}

/// Roll up all deterministic signals from one raw post.
#[must_use]
pub fn rollup_signals(raw_text: &str) -> SignalRollup {
    let lower = raw_text.to_ascii_lowercase();
    // Pad so needles with boundary spaces match at the edges too.
    let padded = format!(" {lower} ");

    let mut rollup = SignalRollup::default();

    for caps in SEC_RE.captures_iter(raw_text) {
        push_unique(
            &mut rollup.specific_student_levels,
            format!("Sec {}", &caps[1]),
        );
        push_unique(&mut rollup.levels, "Secondary".to_string());
    }
    for caps in PRI_RE.captures_iter(raw_text) {
        push_unique(&mut rollup.specific_student_levels, format!("P{}", &caps[1]));
        push_unique(&mut rollup.levels, "Primary".to_string());
    }
    for caps in JC_RE.captures_iter(raw_text) {
        push_unique(&mut rollup.specific_student_levels, format!("JC{}", &caps[1]));
        push_unique(&mut rollup.levels, "JC".to_string());
    }

    for (canonical, needles) in LEVEL_KEYWORDS {
        if needles.iter().any(|n| padded.contains(n)) {
            push_unique(&mut rollup.levels, (*canonical).to_string());
        }
    }

    for (canonical, needles) in SUBJECT_KEYWORDS {
        if needles.iter().any(|n| padded.contains(n)) {
            push_unique(&mut rollup.subjects, (*canonical).to_string());
        }
    }

    rollup
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_rollup() {
        let r = rollup_signals("Sec 3 Math, Tampines 520123, $40/hr, Mon 7-9pm");
        assert!(r.levels.contains(&"Secondary".to_string()));
        assert_eq!(r.specific_student_levels, vec!["Sec 3"]);
        assert!(r.subjects.contains(&"Math".to_string()));
    }

    #[test]
    fn test_primary_short_form() {
        let r = rollup_signals("P5 English & Science, Bishan");
        assert_eq!(r.specific_student_levels, vec!["P5"]);
        assert!(r.levels.contains(&"Primary".to_string()));
        assert!(r.subjects.contains(&"English".to_string()));
        assert!(r.subjects.contains(&"Science".to_string()));
    }

    #[test]
    fn test_jc_and_h2() {
        let r = rollup_signals("JC2 H2 Chemistry, Bukit Timah");
        assert!(r.levels.contains(&"JC".to_string()));
        assert_eq!(r.specific_student_levels, vec!["JC2"]);
        assert!(r.subjects.contains(&"Chemistry".to_string()));
    }

    #[test]
    fn test_amath_beats_math() {
        let r = rollup_signals("Sec 4 A Math tuition needed");
        assert!(r.subjects.contains(&"A Math".to_string()));
    }

    #[test]
    fn test_dedup_repeated_mentions() {
        let r = rollup_signals("Math math MATH, Sec 3 and Sec 3 again");
        assert_eq!(r.subjects.iter().filter(|s| *s == "Math").count(), 1);
        assert_eq!(r.specific_student_levels, vec!["Sec 3"]);
    }

    #[test]
    fn test_empty_text() {
        let r = rollup_signals("");
        assert!(r.levels.is_empty());
        assert!(r.subjects.is_empty());
        assert!(r.specific_student_levels.is_empty());
    }

    #[test]
    fn test_ib_igcse() {
        let r = rollup_signals("IGCSE Physics for IB student");
        assert!(r.levels.contains(&"IGCSE".to_string()));
        assert!(r.levels.contains(&"IB".to_string()));
    }

    #[test]
    fn test_rollup_is_idempotent_on_rerun() {
        let text = "Sec 3 E Math and Physics, Hougang";
        assert_eq!(rollup_signals(text), rollup_signals(text));
    }
}
