//! Level-aware subject canonicalization
//!
//! Free-text subject labels map through an alias table to stable codes
//! (`MATH.SEC_EMATH`) and their parent categories (`MATH`). The table is
//! versioned; bump [`CANONICALIZATION_VERSION`] whenever an alias or code
//! changes so reprocessed assignments record which mapping produced them.

use regex::Regex;
use std::sync::LazyLock;

/// Version of the alias table below.
pub const CANONICALIZATION_VERSION: i32 = 3;

/// Canonical output: stable codes plus their parent categories, both
/// deduplicated and in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalSubjects {
    pub canonical: Vec<String>,
    pub general: Vec<String>,
}

/// Level bands the alias table distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LevelBand {
    Primary,
    Secondary,
    Jc,
    Ib,
    Igcse,
}

impl LevelBand {
    fn from_hint(hint: &str) -> Option<Self> {
        let h = hint.to_ascii_lowercase();
        if h.contains("primary") || h.starts_with('p') && h[1..].trim().parse::<u8>().is_ok() {
            Some(Self::Primary)
        } else if h.contains("secondary") || h.starts_with("sec") {
            Some(Self::Secondary)
        } else if h.contains("jc") || h.contains("junior college") {
            Some(Self::Jc)
        } else if h.contains("igcse") {
            Some(Self::Igcse)
        } else if h.contains("ib") {
            Some(Self::Ib)
        } else {
            None
        }
    }

    fn code_segment(self) -> &'static str {
        match self {
            Self::Primary => "PRI",
            Self::Secondary => "SEC",
            Self::Jc => "JC",
            Self::Ib => "IB",
            Self::Igcse => "IGCSE",
        }
    }
}

/// One alias row: lowercase label, per-band code suffix (None = band not
/// offered), parent category.
struct Alias {
    labels: &'static [&'static str],
    category: &'static str,
    /// Suffix appended after the band segment, e.g. `EMATH` for
    /// `MATH.SEC_EMATH`. Empty means the band segment stands alone
    /// (`ENG.PRI`).
    suffix: &'static str,
    /// Bands this subject exists at; labels matched outside them fall back
    /// to every listed band.
    bands: &'static [LevelBand],
}

use LevelBand::{Ib, Igcse, Jc, Primary, Secondary};

static ALIASES: &[Alias] = &[
    Alias {
        labels: &["math", "maths", "mathematics", "e math", "emath", "e-math", "elementary math"],
        category: "MATH",
        suffix: "EMATH",
        bands: &[Primary, Secondary, Jc, Ib, Igcse],
    },
    Alias {
        labels: &["a math", "amath", "a-math", "additional math", "add math"],
        category: "MATH",
        suffix: "AMATH",
        bands: &[Secondary],
    },
    Alias {
        labels: &["h2 math", "h1 math"],
        category: "MATH",
        suffix: "H2MATH",
        bands: &[Jc],
    },
    Alias {
        labels: &["english", "eng", "el"],
        category: "ENG",
        suffix: "",
        bands: &[Primary, Secondary, Jc, Ib, Igcse],
    },
    Alias {
        labels: &["general paper", "gp"],
        category: "ENG",
        suffix: "GP",
        bands: &[Jc],
    },
    Alias {
        labels: &["science", "sci"],
        category: "SCI",
        suffix: "",
        bands: &[Primary, Secondary, Igcse],
    },
    Alias {
        labels: &["physics", "phy"],
        category: "SCI",
        suffix: "PHY",
        bands: &[Secondary, Jc, Ib, Igcse],
    },
    Alias {
        labels: &["chemistry", "chem"],
        category: "SCI",
        suffix: "CHEM",
        bands: &[Secondary, Jc, Ib, Igcse],
    },
    Alias {
        labels: &["biology", "bio"],
        category: "SCI",
        suffix: "BIO",
        bands: &[Secondary, Jc, Ib, Igcse],
    },
    Alias {
        labels: &["chinese", "mandarin", "cl", "higher chinese", "hcl"],
        category: "LANG",
        suffix: "CHI",
        bands: &[Primary, Secondary, Jc],
    },
    Alias {
        labels: &["malay", "ml"],
        category: "LANG",
        suffix: "MAL",
        bands: &[Primary, Secondary],
    },
    Alias {
        labels: &["tamil", "tl"],
        category: "LANG",
        suffix: "TAM",
        bands: &[Primary, Secondary],
    },
    Alias {
        labels: &["history", "hist"],
        category: "HUM",
        suffix: "HIST",
        bands: &[Secondary, Jc, Ib],
    },
    Alias {
        labels: &["geography", "geog"],
        category: "HUM",
        suffix: "GEOG",
        bands: &[Secondary, Jc, Ib],
    },
    Alias {
        labels: &["literature", "lit"],
        category: "HUM",
        suffix: "LIT",
        bands: &[Secondary, Jc, Ib],
    },
    Alias {
        labels: &["social studies", "ss"],
        category: "HUM",
        suffix: "SS",
        bands: &[Secondary],
    },
    Alias {
        labels: &["economics", "econs", "econ"],
        category: "HUM",
        suffix: "ECONS",
        bands: &[Jc, Ib],
    },
    Alias {
        labels: &["principles of accounts", "poa", "accounting"],
        category: "HUM",
        suffix: "POA",
        bands: &[Secondary],
    },
];

/// Shape of an already-canonical code; these pass through unchanged so the
/// mapping is a fixed point on its own output.
static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]+\.[A-Z0-9_]+$").unwrap());

fn code_for(alias: &Alias, band: LevelBand) -> String {
    if alias.suffix.is_empty() {
        format!("{}.{}", alias.category, band.code_segment())
    } else {
        format!("{}.{}_{}", alias.category, band.code_segment(), alias.suffix)
    }
}

fn push_unique(out: &mut Vec<String>, value: String) {
    if !out.contains(&value) {
        out.push(value);
    }
}

/// Map free-text subject labels to canonical codes, using level hints to
/// pick the band. Unknown labels are dropped (they survive in
/// `signals_subjects`). Re-canonicalizing codes is the identity.
#[must_use]
pub fn canonicalize(level_hints: &[String], labels: &[String]) -> CanonicalSubjects {
    let bands: Vec<LevelBand> = {
        let mut out = Vec::new();
        for hint in level_hints {
            if let Some(band) = LevelBand::from_hint(hint)
                && !out.contains(&band)
            {
                out.push(band);
            }
        }
        out
    };

    let mut result = CanonicalSubjects::default();
    for label in labels {
        let trimmed = label.trim();
        if trimmed.is_empty() {
            continue;
        }
        // Fixed point: existing codes pass through.
        if CODE_RE.is_match(trimmed) {
            if let Some(category) = trimmed.split('.').next() {
                push_unique(&mut result.canonical, trimmed.to_string());
                push_unique(&mut result.general, category.to_string());
            }
            continue;
        }
        let lower = trimmed.to_ascii_lowercase();
        let Some(alias) = ALIASES.iter().find(|a| a.labels.contains(&lower.as_str()))
        else {
            continue;
        };
        // Bands that both match the hints and exist for this subject;
        // no usable hint means every band the subject is offered at.
        let matched: Vec<LevelBand> = bands
            .iter()
            .copied()
            .filter(|b| alias.bands.contains(b))
            .collect();
        let effective: &[LevelBand] = if matched.is_empty() { alias.bands } else { &matched };
        for band in effective {
            push_unique(&mut result.canonical, code_for(alias, *band));
        }
        push_unique(&mut result.general, alias.category.to_string());
    }
    result
}
