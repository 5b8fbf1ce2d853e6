//! Embedding provider seam.
//!
//! The engine consumes embedding as an external capability: anything that
//! maps text to a fixed-length vector, versioned by model id. The in-tree
//! implementation is an FNV-1a feature-hashing embedder — deterministic,
//! dependency-free, and always available — so the index, ranker, and cache
//! behave identically across runs and in tests. ML-backed providers plug in
//! through the same trait.

use std::fmt;

/// Maps text to a fixed-length vector. Implementations must be deterministic
/// per model version: the same text and version always yield the same vector.
pub trait Embedder: Send + Sync {
    /// Embed one text into a unit-length vector of [`Embedder::dimension`].
    fn encode(&self, text: &str) -> Vec<f32>;

    /// Output dimension, constant for the lifetime of the provider.
    fn dimension(&self) -> usize;

    /// Model version identifier the resulting vectors are tagged with.
    fn model_version(&self) -> &str;
}

impl fmt::Debug for dyn Embedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embedder")
            .field("model_version", &self.model_version())
            .field("dimension", &self.dimension())
            .finish()
    }
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// FNV-1a feature-hashing embedder.
///
/// Each whitespace token (plus its character trigrams, which give partial
/// matches on part identifiers and sequence vocabulary) is hashed into a
/// bucket with a +/-1 sign bit; the accumulated vector is L2-normalized.
pub struct HashEmbedder {
    dimension: usize,
    model_version: String,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model_version: format!("fnv1a-{dimension}-v1"),
        }
    }

    fn accumulate(&self, feature: &[u8], out: &mut [f32]) {
        let h = fnv1a(feature);
        let bucket = (h % self.dimension as u64) as usize;
        let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        out[bucket] += sign;
    }
}

impl Embedder for HashEmbedder {
    fn encode(&self, text: &str) -> Vec<f32> {
        let mut out = vec![0.0f32; self.dimension];

        for token in text.split_whitespace() {
            let lower = token.to_lowercase();
            self.accumulate(lower.as_bytes(), &mut out);

            let chars: Vec<char> = lower.chars().collect();
            if chars.len() > 3 {
                for window in chars.windows(3) {
                    let tri: String = window.iter().collect();
                    self.accumulate(tri.as_bytes(), &mut out);
                }
            }
        }

        let norm: f32 = out.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut out {
                *v /= norm;
            }
        }
        out
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_version(&self) -> &str {
        &self.model_version
    }
}
