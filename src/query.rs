//! Query normalization, intent classification, and term expansion.
//!
//! `optimize` is a pure function: the same raw query, filters, and lexicon
//! version always yield the same plan. Normalization is deterministic for the
//! same reason canonicalization matters before embedding — the normalized
//! form feeds both the embedder and the cache key, so any hidden randomness
//! would split the cache and destabilize ranking.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use unicode_normalization::UnicodeNormalization;

use crate::model::PartFilters;

/// Version of the static synonym lexicon. Bump when [`SYNONYMS`] changes so
/// cached results keyed on an older lexicon are never served.
pub const LEXICON_VERSION: &str = "synbio-lex-2";

/// Closed set of query intents, classified by deterministic token rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    /// Free-text lookup; the default.
    Informational,
    /// Empty or trivial text with non-empty filters: the filters carry the query.
    FilterHeavy,
    /// A single token shaped like a part identifier (e.g. "BBa_J23100").
    ExactId,
}

/// Output of [`optimize`]: everything downstream stages need from the raw text.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// Lower-cased, NFC-normalized, whitespace-collapsed text.
    pub normalized: String,
    /// Tokens in order of appearance, duplicates removed.
    pub tokens: Vec<String>,
    /// Synonym expansions not already present among the tokens.
    pub expanded: SmallVec<[String; 8]>,
    pub intent: QueryIntent,
}

impl QueryPlan {
    /// Text handed to the embedder: normalized query plus expansions.
    pub fn embedding_text(&self) -> String {
        if self.expanded.is_empty() {
            return self.normalized.clone();
        }
        let mut text = self.normalized.clone();
        for term in &self.expanded {
            text.push(' ');
            text.push_str(term);
        }
        text
    }
}

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-z0-9][a-z0-9_\-.]*").expect("token regex"));

/// Part identifiers in registry shape: alphabetic prefix, underscore, then an
/// alphanumeric accession ("bba_j23100", "psb_1c3").
static PART_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z]{2,4}_[a-z]?\d+[a-z0-9]*$").expect("part id regex"));

/// Static synonym table, versioned by [`LEXICON_VERSION`]. Pairs map a query
/// token to domain terms the catalog uses; expansion is one-directional.
static SYNONYMS: Lazy<Vec<(&'static str, &'static [&'static str])>> = Lazy::new(|| {
    vec![
        ("promoter", &["transcription", "upstream"][..]),
        ("rbs", &["ribosome", "binding"][..]),
        ("cds", &["coding", "orf"][..]),
        ("orf", &["cds", "coding"][..]),
        ("terminator", &["transcription", "stop"][..]),
        ("gfp", &["fluorescent", "reporter"][..]),
        ("rfp", &["fluorescent", "reporter"][..]),
        ("reporter", &["fluorescent"][..]),
        ("dna", &["nucleotide", "sequence"][..]),
        ("protein", &["peptide", "amino"][..]),
        ("enzyme", &["protein", "catalytic"][..]),
        ("plasmid", &["vector", "backbone"][..]),
        ("vector", &["plasmid", "backbone"][..]),
        ("inducible", &["regulated"][..]),
        ("constitutive", &["unregulated"][..]),
        ("repressor", &["regulator", "inhibitor"][..]),
        ("activator", &["regulator"][..]),
    ]
});

/// Normalize, classify, and expand a raw query. Pure and deterministic for a
/// given lexicon version.
pub fn optimize(raw: &str, filters: &PartFilters) -> QueryPlan {
    let normalized: String = raw.nfc().collect::<String>().to_lowercase();

    let mut seen = HashSet::new();
    let mut tokens = Vec::new();
    for m in TOKEN_RE.find_iter(&normalized) {
        let tok = m.as_str().to_string();
        if seen.insert(tok.clone()) {
            tokens.push(tok);
        }
    }
    let normalized = tokens.join(" ");

    let intent = classify(&tokens, filters);

    let mut expanded: SmallVec<[String; 8]> = SmallVec::new();
    if intent != QueryIntent::ExactId {
        for token in &tokens {
            if let Some((_, terms)) = SYNONYMS.iter().find(|(k, _)| k == token) {
                for term in *terms {
                    if !seen.contains(*term) && !expanded.iter().any(|e| e == term) {
                        expanded.push((*term).to_string());
                    }
                }
            }
        }
    }

    QueryPlan {
        normalized,
        tokens,
        expanded,
        intent,
    }
}

fn classify(tokens: &[String], filters: &PartFilters) -> QueryIntent {
    if tokens.len() == 1 && PART_ID_RE.is_match(&tokens[0]) {
        return QueryIntent::ExactId;
    }
    if tokens.is_empty() && !filters.is_empty() {
        return QueryIntent::FilterHeavy;
    }
    // Short queries dominated by filter constraints behave like filter scans.
    if !filters.is_empty() && tokens.len() < 2 {
        return QueryIntent::FilterHeavy;
    }
    QueryIntent::Informational
}

/// Cache key over the normalized query, filter signature, lexicon version,
/// and embedding model version. Any change to one of those must miss.
pub fn cache_key(plan: &QueryPlan, filters: &PartFilters, model_version: &str, top_k: usize) -> u64 {
    let mut hasher = fxhash::FxHasher64::default();
    plan.normalized.hash(&mut hasher);
    filters.signature().hash(&mut hasher);
    LEXICON_VERSION.hash(&mut hasher);
    model_version.hash(&mut hasher);
    top_k.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SequenceKind;

    #[test]
    fn optimize_is_deterministic() {
        let filters = PartFilters::default();
        let a = optimize("Strong Constitutive PROMOTER", &filters);
        let b = optimize("Strong Constitutive PROMOTER", &filters);
        assert_eq!(a, b);
        assert_eq!(a.normalized, "strong constitutive promoter");
    }

    #[test]
    fn unicode_is_nfc_normalized() {
        let filters = PartFilters::default();
        // "café" composed vs decomposed must normalize identically.
        let composed = optimize("caf\u{e9} promoter", &filters);
        let decomposed = optimize("cafe\u{301} promoter", &filters);
        assert_eq!(composed.normalized, decomposed.normalized);
    }

    #[test]
    fn part_id_classifies_as_exact_lookup() {
        let filters = PartFilters::default();
        let plan = optimize("BBa_J23100", &filters);
        assert_eq!(plan.intent, QueryIntent::ExactId);
        assert!(plan.expanded.is_empty());
    }

    #[test]
    fn empty_text_with_filters_is_filter_heavy() {
        let mut filters = PartFilters::default();
        filters.kinds.insert(SequenceKind::Dna);
        let plan = optimize("", &filters);
        assert_eq!(plan.intent, QueryIntent::FilterHeavy);
        assert!(plan.tokens.is_empty());
    }

    #[test]
    fn synonyms_expand_without_duplicates() {
        let filters = PartFilters::default();
        let plan = optimize("gfp reporter promoter", &filters);
        assert_eq!(plan.intent, QueryIntent::Informational);
        // "fluorescent" comes from both gfp and reporter but appears once.
        assert_eq!(
            plan.expanded.iter().filter(|t| *t == "fluorescent").count(),
            1
        );
        // Terms already present in the query are not re-added.
        assert!(!plan.expanded.iter().any(|t| t == "reporter"));
    }

    #[test]
    fn cache_key_varies_with_inputs() {
        let filters = PartFilters::default();
        let plan = optimize("promoter", &filters);
        let base = cache_key(&plan, &filters, "fnv1a-256-v1", 10);
        assert_eq!(base, cache_key(&plan, &filters, "fnv1a-256-v1", 10));
        assert_ne!(base, cache_key(&plan, &filters, "fnv1a-256-v2", 10));
        assert_ne!(base, cache_key(&plan, &filters, "fnv1a-256-v1", 20));

        let mut other = PartFilters::default();
        other.kinds.insert(SequenceKind::Protein);
        assert_ne!(base, cache_key(&plan, &other, "fnv1a-256-v1", 10));
    }

    #[test]
    fn embedding_text_appends_expansions() {
        let filters = PartFilters::default();
        let plan = optimize("rbs", &filters);
        let text = plan.embedding_text();
        assert!(text.starts_with("rbs"));
        assert!(text.contains("ribosome"));
    }
}
