//! Composite scoring and deterministic result ordering.
//!
//! Scoring is a pure function over declared signals and configuration —
//! vector similarity, relational filter match, and a usage prior — combined
//! as a weighted sum. Ties are broken by historical success rate, then by
//! lexicographically smaller id, giving a total order that makes pagination
//! reproducible.

use std::cmp::Ordering;

use crate::config::EngineConfig;

/// Weights for the composite score. Extracted from [`EngineConfig`] so the
/// ranker can be tested in isolation.
#[derive(Debug, Clone, Copy)]
pub struct RankWeights {
    pub similarity: f64,
    pub filter_match: f64,
    pub usage_prior: f64,
}

impl RankWeights {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            similarity: cfg.rank_similarity_weight,
            filter_match: cfg.rank_filter_weight,
            usage_prior: cfg.rank_usage_weight,
        }
    }
}

impl Default for RankWeights {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Cosine similarity mapped into [0, 1].
///
/// Inputs need not be unit length; zero vectors score 0.
pub fn cosine_01(a: &[f32], b: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        dot += x as f64 * y as f64;
        na += x as f64 * x as f64;
        nb += y as f64 * y as f64;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    let cos = (dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0);
    (cos + 1.0) / 2.0
}

/// Weighted sum of the declared signals; each input is expected in [0, 1].
pub fn combine(similarity: f64, filter_match: f64, usage_prior: f64, w: &RankWeights) -> f64 {
    (similarity * w.similarity + filter_match * w.filter_match + usage_prior * w.usage_prior)
        .clamp(0.0, 1.0)
}

/// A candidate awaiting final ordering.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub id: String,
    pub composite: f64,
    /// Historical success rate in [0, 1], the first tie-breaker.
    pub success_rate: f64,
}

/// Total order: composite desc, success rate desc, id asc.
pub fn total_order(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    b.composite
        .partial_cmp(&a.composite)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.success_rate
                .partial_cmp(&a.success_rate)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.id.cmp(&b.id))
}
