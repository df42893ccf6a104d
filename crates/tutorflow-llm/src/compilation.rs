//! Compilation detection heuristics
//!
//! A "compilation" is a single post carrying several independent
//! assignments. Heuristics only *flag* a candidate; the LLM always confirms
//! and performs the split. The heuristic is pluggable because agencies
//! format compilations differently and the cheap pre-check is the part
//! worth swapping per deployment.

use regex::Regex;
use std::sync::LazyLock;

/// Pre-check deciding whether a post is worth a compilation confirmation
/// round-trip.
pub trait CompilationHeuristic: Send + Sync {
    fn looks_like_compilation(&self, raw_text: &str) -> bool;
}

/// Numbered-block heuristic: two or more `Assignment N:`-style headers, or
/// two or more explicit code-prefixed blocks.
static NUMBERED_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:assignment|case|job|tuition)\s*#?\s*\d+\s*[:.)\-]").unwrap()
});

static CODE_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:code|ref)\s*[:#]\s*\S+").unwrap());

/// Default heuristic used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCompilationHeuristic;

impl CompilationHeuristic for DefaultCompilationHeuristic {
    fn looks_like_compilation(&self, raw_text: &str) -> bool {
        if NUMBERED_BLOCK_RE.find_iter(raw_text).count() >= 2 {
            return true;
        }
        CODE_HEADER_RE.find_iter(raw_text).count() >= 2
    }
}
