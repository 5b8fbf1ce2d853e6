//! Domain entity structs.
//!
//! `PartRecord` is owned by the ingestion collaborator and read-only inside
//! the engine; records are replaced wholesale on text change (which triggers
//! re-embedding), never mutated in place.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Broad sequence family derived from the type hierarchy. Used as a
/// filterable field, mirroring the catalog's browse axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceKind {
    Dna,
    Protein,
    Other,
}

impl SequenceKind {
    /// Classify from the top level of the type hierarchy.
    pub fn from_hierarchy(level1: &str) -> Self {
        let l = level1.to_ascii_lowercase();
        if l.contains("protein") || l.contains("peptide") || l.contains("enzyme") {
            SequenceKind::Protein
        } else if l.contains("dna")
            || l.contains("promoter")
            || l.contains("rbs")
            || l.contains("cds")
            || l.contains("terminator")
            || l.contains("plasmid")
        {
            SequenceKind::Dna
        } else {
            SequenceKind::Other
        }
    }
}

/// A catalog part record as delivered by the ingestion feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartRecord {
    /// Unique, stable identifier (e.g. "BBa_J23100").
    pub id: String,
    pub label: String,
    /// Descriptive text; the embedding input.
    pub text: String,
    /// Raw sequence (nucleotides or amino acids).
    #[serde(default)]
    pub sequence: String,
    /// Type hierarchy, most general first; up to three levels.
    #[serde(default)]
    pub type_hierarchy: Vec<String>,
    /// Engineering/metadata fields, kept opaque to the core.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PartRecord {
    /// Sequence family derived from the first hierarchy level.
    pub fn sequence_kind(&self) -> SequenceKind {
        self.type_hierarchy
            .first()
            .map(|l| SequenceKind::from_hierarchy(l))
            .unwrap_or(SequenceKind::Other)
    }

    /// Hierarchy level by index (1-based), empty when absent.
    pub fn hierarchy_level(&self, level: usize) -> &str {
        level
            .checked_sub(1)
            .and_then(|i| self.type_hierarchy.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Relational filters applied alongside (or instead of) the vector search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartFilters {
    /// Restrict to these sequence kinds (empty = no restriction).
    #[serde(default)]
    pub kinds: HashSet<SequenceKind>,
    /// Restrict on hierarchy levels 1-3 (exact, case-insensitive match).
    #[serde(default)]
    pub hierarchy: Vec<String>,
    /// Metadata key/value equality constraints.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PartFilters {
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty() && self.hierarchy.is_empty() && self.metadata.is_empty()
    }

    /// Whether the record satisfies every constraint.
    pub fn matches(&self, record: &PartRecord) -> bool {
        self.match_score(record) >= 1.0 - f64::EPSILON || self.is_empty()
    }

    /// Fraction of constraints the record satisfies, in [0, 1].
    /// An empty filter scores 1.0 (vacuously matched).
    pub fn match_score(&self, record: &PartRecord) -> f64 {
        let mut total = 0usize;
        let mut matched = 0usize;

        if !self.kinds.is_empty() {
            total += 1;
            if self.kinds.contains(&record.sequence_kind()) {
                matched += 1;
            }
        }
        for (i, want) in self.hierarchy.iter().enumerate() {
            if want.is_empty() {
                continue;
            }
            total += 1;
            if record.hierarchy_level(i + 1).eq_ignore_ascii_case(want) {
                matched += 1;
            }
        }
        for (key, want) in &self.metadata {
            total += 1;
            if record.metadata.get(key).is_some_and(|v| v == want) {
                matched += 1;
            }
        }

        if total == 0 {
            1.0
        } else {
            matched as f64 / total as f64
        }
    }

    /// Stable signature for cache keying: identical filters always produce
    /// the same string regardless of construction order.
    pub fn signature(&self) -> String {
        let mut kinds: Vec<&str> = self
            .kinds
            .iter()
            .map(|k| match k {
                SequenceKind::Dna => "dna",
                SequenceKind::Protein => "protein",
                SequenceKind::Other => "other",
            })
            .collect();
        kinds.sort_unstable();

        let meta: Vec<String> = self
            .metadata
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        format!(
            "k:{}|h:{}|m:{}",
            kinds.join(","),
            self.hierarchy.join("/").to_ascii_lowercase(),
            meta.join(",")
        )
    }
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub label: String,
    /// Composite score in [0, 1].
    pub score: f64,
    /// Which fields contributed the match (e.g. "vector", "kind", "hierarchy").
    pub matched_fields: Vec<String>,
}

/// A fully ranked response, with the staleness flag attached when the served
/// snapshot was older than the configured freshness bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    /// Non-fatal warning: the served snapshot was stale.
    pub stale: bool,
}

/// Everything a single query carries through the pipeline.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub raw: String,
    pub filters: PartFilters,
    pub top_k: usize,
    /// Total time budget the deadline was derived from.
    pub budget: Duration,
    pub deadline: Instant,
}

impl QueryContext {
    pub fn new(raw: impl Into<String>, filters: PartFilters, top_k: usize, budget: Duration) -> Self {
        Self {
            raw: raw.into(),
            filters,
            top_k,
            budget,
            deadline: Instant::now() + budget,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}
