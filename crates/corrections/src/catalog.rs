//! Static semantic catalog (spec §A.6; ported from `semantic_catalog.py`).
//!
//! A pragmatic bootstrap vocabulary for exercise resolution, overridden by
//! user-specific aliases at runtime. Used by INV-001 proposal generation
//! (§4.6.2): catalog variant exact match, then catalog key slug match, then
//! a slug fallback.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub domain: &'static str,
    pub canonical_key: &'static str,
    pub canonical_label: &'static str,
    pub variants: &'static [&'static str],
}

pub const EXERCISE_CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        domain: "exercise",
        canonical_key: "barbell_back_squat",
        canonical_label: "Barbell Back Squat",
        variants: &["back squat", "squat", "kniebeuge", "barbell squat"],
    },
    CatalogEntry {
        domain: "exercise",
        canonical_key: "barbell_bench_press",
        canonical_label: "Barbell Bench Press",
        variants: &["bench press", "bankdruecken", "bankdrücken", "bb bench"],
    },
    CatalogEntry {
        domain: "exercise",
        canonical_key: "barbell_deadlift",
        canonical_label: "Barbell Deadlift",
        variants: &["deadlift", "kreuzheben", "conventional deadlift"],
    },
    CatalogEntry {
        domain: "exercise",
        canonical_key: "barbell_overhead_press",
        canonical_label: "Barbell Overhead Press",
        variants: &["overhead press", "shoulder press", "military press", "schulterdruecken"],
    },
    CatalogEntry {
        domain: "exercise",
        canonical_key: "pull_up",
        canonical_label: "Pull-Up",
        variants: &["pull up", "chin up", "klimmzug"],
    },
    CatalogEntry {
        domain: "exercise",
        canonical_key: "barbell_row",
        canonical_label: "Barbell Row",
        variants: &["barbell row", "bent over row", "rudern"],
    },
];

/// Lowercase, trim, and collapse internal whitespace/non-alphanumerics to
/// single underscores — the slug fallback used when no catalog entry matches.
pub fn slugify(term: &str) -> String {
    let lowered = term.trim().to_lowercase();
    let mut slug = String::with_capacity(lowered.len());
    let mut last_was_sep = true;
    for ch in lowered.chars() {
        if ch.is_alphanumeric() {
            slug.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('_');
            last_was_sep = true;
        }
    }
    slug.trim_end_matches('_').to_string()
}

/// The three candidate sources INV-001 considers, in priority order
/// (spec §4.6.2). `CatalogVariantExact`/`CatalogKeySlug` are deterministic;
/// `SlugFallback` is not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogMatch {
    VariantExact { canonical_key: String },
    KeySlug { canonical_key: String },
    SlugFallback { canonical_key: String },
}

impl CatalogMatch {
    pub fn canonical_key(&self) -> &str {
        match self {
            Self::VariantExact { canonical_key }
            | Self::KeySlug { canonical_key }
            | Self::SlugFallback { canonical_key } => canonical_key,
        }
    }

    pub fn is_deterministic(&self) -> bool {
        !matches!(self, Self::SlugFallback { .. })
    }

    pub fn source_name(&self) -> &'static str {
        match self {
            Self::VariantExact { .. } => "catalog_variant_exact",
            Self::KeySlug { .. } => "catalog_key_slug_match",
            Self::SlugFallback { .. } => "slug_fallback",
        }
    }

    /// Confidence banded per §4.6.2: 0.95 / 0.9 / 0.55.
    pub fn confidence(&self) -> f64 {
        match self {
            Self::VariantExact { .. } => 0.95,
            Self::KeySlug { .. } => 0.9,
            Self::SlugFallback { .. } => 0.55,
        }
    }
}

/// Resolve a user-supplied exercise term against the catalog, per §4.6.2.
pub fn resolve_exercise_term(term: &str) -> CatalogMatch {
    let normalized = term.trim().to_lowercase();

    for entry in EXERCISE_CATALOG {
        if entry.variants.iter().any(|v| *v == normalized) {
            return CatalogMatch::VariantExact {
                canonical_key: entry.canonical_key.to_string(),
            };
        }
    }

    let slug = slugify(&normalized);
    for entry in EXERCISE_CATALOG {
        if entry.canonical_key == slug {
            return CatalogMatch::KeySlug {
                canonical_key: entry.canonical_key.to_string(),
            };
        }
    }

    CatalogMatch::SlugFallback { canonical_key: slug }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_variant_match_is_deterministic() {
        let m = resolve_exercise_term("Kniebeuge");
        assert_eq!(m, CatalogMatch::VariantExact { canonical_key: "barbell_back_squat".into() });
        assert!(m.is_deterministic());
    }

    #[test]
    fn unknown_term_falls_back_to_slug() {
        let m = resolve_exercise_term("Bulgarian Split Squat");
        assert!(!m.is_deterministic());
        assert_eq!(m.canonical_key(), "bulgarian_split_squat");
    }
}
