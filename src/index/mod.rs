//! Vector index engine.
//!
//! The index is a sequence of immutable [`IndexSnapshot`]s behind a versioned
//! handle. The read path clones the current `Arc` and searches lock-free
//! against that generation; rebuilds run under a writer mutex (bounded
//! exclusive section) and publish the new generation with a single swap, so
//! in-flight queries always see one complete snapshot — never a partially
//! built structure.
//!
//! Query strategy: exact linear scan below `ann_threshold` vectors, HNSW
//! graph search at or above it.

pub mod hnsw;
pub mod persist;
pub mod snapshot;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::index::hnsw::{GraphSource, HnswGraph};
use crate::index::snapshot::{IndexSnapshot, normalize};

/// Outcome of a batch upsert. Rejected records were skipped (per-record
/// isolation); the rest of the batch still went through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub replaced: usize,
    pub rejected: usize,
}

/// Index-level statistics for the stats surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStats {
    pub count: usize,
    pub approximate: bool,
    pub model_version: String,
    pub built_at_ms: i64,
    pub stale: bool,
}

pub struct VectorIndex {
    model_version: String,
    dimension: usize,
    ann_threshold: usize,
    hnsw_m: usize,
    hnsw_ef_construction: usize,
    hnsw_ef_search: usize,
    freshness_bound: Duration,
    /// Serializes rebuilds without ever blocking readers.
    rebuild_lock: Mutex<()>,
    /// The currently published generation.
    current: RwLock<Arc<IndexSnapshot>>,
}

impl VectorIndex {
    pub fn new(model_version: impl Into<String>, cfg: &EngineConfig) -> Self {
        let model_version = model_version.into();
        let empty = IndexSnapshot::empty(model_version.clone(), cfg.dimension, now_ms());
        Self {
            model_version,
            dimension: cfg.dimension,
            ann_threshold: cfg.ann_threshold,
            hnsw_m: cfg.hnsw_m,
            hnsw_ef_construction: cfg.hnsw_ef_construction,
            hnsw_ef_search: cfg.hnsw_ef_search,
            freshness_bound: cfg.freshness_bound,
            rebuild_lock: Mutex::new(()),
            current: RwLock::new(Arc::new(empty)),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    /// Clone the current generation. Held snapshots stay valid across
    /// concurrent rebuilds.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.current.read().clone()
    }

    /// Insert or replace a single vector.
    pub fn insert(&self, id: impl Into<String>, vector: Vec<f32>) -> EngineResult<()> {
        let id = id.into();
        if vector.len() != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        self.upsert_batch(vec![(id, vector)]);
        Ok(())
    }

    /// Apply a batch of inserts/replacements and publish a new snapshot.
    ///
    /// Dimension mismatches reject only the offending record; the batch
    /// continues. At most one vector per id survives — re-embedding replaces.
    pub fn upsert_batch(&self, entries: Vec<(String, Vec<f32>)>) -> BatchOutcome {
        let _guard = self.rebuild_lock.lock();
        let base = self.snapshot();

        let mut outcome = BatchOutcome::default();
        let mut ids: Vec<String> = base.ids().to_vec();
        let mut slab: Vec<f32> = base.slab().to_vec();
        let mut row_of: FxHashMap<String, usize> = ids
            .iter()
            .enumerate()
            .map(|(row, id)| (id.clone(), row))
            .collect();

        for (id, mut vector) in entries {
            if vector.len() != self.dimension {
                tracing::warn!(
                    id = %id,
                    expected = self.dimension,
                    got = vector.len(),
                    "rejecting vector with mismatched dimension"
                );
                outcome.rejected += 1;
                continue;
            }
            normalize(&mut vector);
            match row_of.get(&id) {
                Some(&row) => {
                    let start = row * self.dimension;
                    slab[start..start + self.dimension].copy_from_slice(&vector);
                    outcome.replaced += 1;
                }
                None => {
                    row_of.insert(id.clone(), ids.len());
                    ids.push(id);
                    slab.extend_from_slice(&vector);
                    outcome.inserted += 1;
                }
            }
        }

        let next = self.build_snapshot(ids, slab);
        let count = next.len();
        let approximate = next.has_graph();
        *self.current.write() = Arc::new(next);

        tracing::info!(
            count,
            approximate,
            inserted = outcome.inserted,
            replaced = outcome.replaced,
            rejected = outcome.rejected,
            "published index snapshot"
        );
        outcome
    }

    fn build_snapshot(&self, ids: Vec<String>, slab: Vec<f32>) -> IndexSnapshot {
        let graph = if ids.len() >= self.ann_threshold {
            Some(HnswGraph::build(
                &GraphSource {
                    ids: &ids,
                    slab: &slab,
                    dimension: self.dimension,
                },
                self.hnsw_m,
                self.hnsw_ef_construction,
            ))
        } else {
            None
        };
        IndexSnapshot::assemble(
            self.model_version.clone(),
            self.dimension,
            ids,
            slab,
            graph,
            now_ms(),
        )
    }

    /// k-NN query against the current snapshot. Empty index yields an empty
    /// list, not an error.
    pub fn query(&self, vector: &[f32], k: usize) -> EngineResult<Vec<(String, f32)>> {
        if vector.len() != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        let snapshot = self.snapshot();
        let mut query = vector.to_vec();
        normalize(&mut query);
        let hits = snapshot.search(&query, k, self.hnsw_ef_search);
        Ok(hits
            .into_iter()
            .map(|(row, dist)| (snapshot.id_at(row).to_string(), dist))
            .collect())
    }

    /// Whether the given snapshot is older than the freshness bound.
    pub fn is_stale(&self, snapshot: &IndexSnapshot) -> bool {
        let age_ms = now_ms().saturating_sub(snapshot.built_at_ms);
        age_ms as u128 > self.freshness_bound.as_millis()
    }

    pub fn stats(&self) -> IndexStats {
        let snapshot = self.snapshot();
        IndexStats {
            count: snapshot.len(),
            approximate: snapshot.has_graph(),
            model_version: self.model_version.clone(),
            built_at_ms: snapshot.built_at_ms,
            stale: self.is_stale(&snapshot),
        }
    }

    /// Persist the current snapshot.
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        persist::save_snapshot(&snapshot, path)
    }

    /// Replace the current snapshot with one restored from disk. The file
    /// must match this index's dimension and model version.
    pub fn restore(&self, path: &Path) -> Result<()> {
        let loaded = persist::load_snapshot(path)
            .with_context(|| format!("load index snapshot {path:?}"))?;
        if loaded.dimension != self.dimension {
            anyhow::bail!(
                "snapshot dimension {} does not match index dimension {}",
                loaded.dimension,
                self.dimension
            );
        }
        if loaded.model_version != self.model_version {
            anyhow::bail!(
                "snapshot was written by model '{}', index uses '{}'",
                loaded.model_version,
                self.model_version
            );
        }
        let _guard = self.rebuild_lock.lock();
        let count = loaded.ids.len();
        let mut snapshot = self.build_snapshot(loaded.ids, loaded.slab);
        snapshot.built_at_ms = loaded.built_at_ms;
        *self.current.write() = Arc::new(snapshot);
        tracing::info!(?path, count, "restored index snapshot");
        Ok(())
    }

    /// Load a snapshot file into a fresh index. The graph is rebuilt from
    /// the slab when the row count crosses the ANN threshold.
    pub fn load(path: &Path, cfg: &EngineConfig) -> Result<Self> {
        let loaded = persist::load_snapshot(path)
            .with_context(|| format!("load index snapshot {path:?}"))?;
        if loaded.dimension != cfg.dimension {
            anyhow::bail!(
                "snapshot dimension {} does not match configured dimension {}",
                loaded.dimension,
                cfg.dimension
            );
        }
        let index = Self::new(loaded.model_version.clone(), cfg);
        let mut snapshot = index.build_snapshot(loaded.ids, loaded.slab);
        snapshot.built_at_ms = loaded.built_at_ms;
        *index.current.write() = Arc::new(snapshot);
        Ok(index)
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dimension: usize) -> EngineConfig {
        EngineConfig {
            dimension,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn insert_rejects_wrong_dimension() {
        let index = VectorIndex::new("test-v1", &test_config(4));
        let err = index.insert("a", vec![1.0, 2.0]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::DimensionMismatch {
                expected: 4,
                got: 2
            }
        ));
    }

    #[test]
    fn query_on_empty_index_returns_empty() {
        let index = VectorIndex::new("test-v1", &test_config(4));
        let hits = index.query(&[1.0, 0.0, 0.0, 0.0], 5).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn query_rejects_wrong_dimension() {
        let index = VectorIndex::new("test-v1", &test_config(4));
        assert!(index.query(&[1.0], 5).is_err());
    }

    #[test]
    fn reinsert_replaces_never_duplicates() {
        let index = VectorIndex::new("test-v1", &test_config(2));
        index.insert("a", vec![1.0, 0.0]).unwrap();
        let outcome = index.upsert_batch(vec![("a".into(), vec![0.0, 1.0])]);
        assert_eq!(outcome.replaced, 1);
        assert_eq!(outcome.inserted, 0);

        let stats = index.stats();
        assert_eq!(stats.count, 1);

        // The replacement vector is the one served.
        let hits = index.query(&[0.0, 1.0], 1).unwrap();
        assert_eq!(hits[0].0, "a");
        assert!(hits[0].1.abs() < 1e-6);
    }

    #[test]
    fn batch_isolates_bad_records() {
        let index = VectorIndex::new("test-v1", &test_config(2));
        let outcome = index.upsert_batch(vec![
            ("good".into(), vec![1.0, 0.0]),
            ("bad".into(), vec![1.0, 0.0, 0.0]),
            ("also-good".into(), vec![0.0, 1.0]),
        ]);
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(index.stats().count, 2);
    }

    #[test]
    fn self_recall_in_exact_mode() {
        let index = VectorIndex::new("test-v1", &test_config(3));
        index.insert("a", vec![1.0, 0.0, 0.0]).unwrap();
        index.insert("b", vec![0.0, 1.0, 0.0]).unwrap();
        index.insert("c", vec![0.0, 0.0, 1.0]).unwrap();

        for (id, v) in [
            ("a", [1.0, 0.0, 0.0]),
            ("b", [0.0, 1.0, 0.0]),
            ("c", [0.0, 0.0, 1.0]),
        ] {
            let hits = index.query(&v, 1).unwrap();
            assert_eq!(hits[0].0, id);
        }
    }

    #[test]
    fn graph_built_above_threshold() {
        let cfg = EngineConfig {
            dimension: 4,
            ann_threshold: 10,
            ..EngineConfig::default()
        };
        let index = VectorIndex::new("test-v1", &cfg);
        let batch: Vec<(String, Vec<f32>)> = (0..20)
            .map(|i| {
                let angle = i as f32 * 0.3;
                (
                    format!("part-{i:03}"),
                    vec![angle.cos(), angle.sin(), (angle * 0.5).cos(), (angle * 0.5).sin()],
                )
            })
            .collect();
        index.upsert_batch(batch);

        let stats = index.stats();
        assert_eq!(stats.count, 20);
        assert!(stats.approximate);
    }

    #[test]
    fn snapshot_survives_rebuild() {
        let index = VectorIndex::new("test-v1", &test_config(2));
        index.insert("a", vec![1.0, 0.0]).unwrap();
        let held = index.snapshot();
        index.insert("b", vec![0.0, 1.0]).unwrap();

        // The held generation is unchanged; the new one has both rows.
        assert_eq!(held.len(), 1);
        assert_eq!(index.snapshot().len(), 2);
    }

    #[test]
    fn near_vectors_rank_before_distant_ones() {
        let index = VectorIndex::new("test-v1", &test_config(3));
        // a and b point the same general direction; c is orthogonal.
        index.insert("a", vec![1.0, 0.05, 0.0]).unwrap();
        index.insert("b", vec![1.0, 0.2, 0.0]).unwrap();
        index.insert("c", vec![0.0, 0.0, 1.0]).unwrap();

        let hits = index.query(&[1.0, 0.05, 0.0], 2).unwrap();
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn restore_replaces_the_live_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("index.psvi");
        let cfg = test_config(2);

        let source = VectorIndex::new("test-v1", &cfg);
        source.insert("a", vec![1.0, 0.0]).unwrap();
        source.save(&path).unwrap();

        let target = VectorIndex::new("test-v1", &cfg);
        assert_eq!(target.stats().count, 0);
        target.restore(&path).unwrap();
        assert_eq!(target.stats().count, 1);

        // Mismatched model version must be rejected.
        let other = VectorIndex::new("test-v2", &cfg);
        assert!(other.restore(&path).is_err());
    }

    #[test]
    fn save_load_roundtrip_preserves_results() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("index.psvi");
        let cfg = test_config(3);

        let index = VectorIndex::new("test-v1", &cfg);
        index.insert("a", vec![1.0, 0.1, 0.0]).unwrap();
        index.insert("b", vec![0.0, 1.0, 0.1]).unwrap();
        index.save(&path).unwrap();

        let reloaded = VectorIndex::load(&path, &cfg).unwrap();
        assert_eq!(reloaded.stats().count, 2);
        let hits = reloaded.query(&[1.0, 0.1, 0.0], 1).unwrap();
        assert_eq!(hits[0].0, "a");
    }
}
