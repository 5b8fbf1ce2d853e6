//! Immutable index snapshots.
//!
//! A snapshot is an arena of unit vectors addressed by stable row offsets:
//! a parallel id list and a contiguous f32 slab, plus an optional HNSW graph
//! over the same offsets. Snapshots are never mutated after construction;
//! rebuilds produce a fresh snapshot that is published by an atomic handle
//! swap in [`crate::index::VectorIndex`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rayon::prelude::*;

use crate::index::hnsw::HnswGraph;

/// Minimum row count before the exact scan is parallelized. Below this,
/// rayon task overhead outweighs the win.
pub(crate) const PARALLEL_THRESHOLD: usize = 10_000;

/// Chunk size for the parallel scan.
pub(crate) const PARALLEL_CHUNK_SIZE: usize = 1024;

/// Cosine distance between two unit vectors: `1 - dot`, in [0, 2].
/// Rows are normalized at ingest, so no per-comparison norms are needed.
pub(crate) fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    1.0 - dot
}

/// Normalize a vector to unit length in place. Zero vectors are left as-is.
pub(crate) fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Row candidate ordered by distance; max-heap root is the current worst,
/// so the heap stays bounded at k entries during the scan.
#[derive(Debug, Clone, Copy, PartialEq)]
struct HeapEntry {
    distance: f32,
    row: u32,
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.row.cmp(&other.row))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One immutable generation of the vector index.
#[derive(Debug)]
pub struct IndexSnapshot {
    /// Embedding model version every vector in the slab was produced by.
    pub model_version: String,
    /// Fixed vector dimension.
    pub dimension: usize,
    /// Record ids, parallel to slab rows.
    ids: Vec<String>,
    /// Row-major unit vectors, `ids.len() * dimension` long.
    slab: Vec<f32>,
    /// Graph for approximate search; absent below the ANN threshold.
    graph: Option<HnswGraph>,
    /// Build time, unix millis. Drives the staleness warning.
    pub built_at_ms: i64,
}

impl IndexSnapshot {
    /// Assemble a snapshot from already-normalized rows. `vectors` must all
    /// have length `dimension`; callers validate before building.
    pub(crate) fn assemble(
        model_version: String,
        dimension: usize,
        ids: Vec<String>,
        slab: Vec<f32>,
        graph: Option<HnswGraph>,
        built_at_ms: i64,
    ) -> Self {
        debug_assert_eq!(slab.len(), ids.len() * dimension);
        Self {
            model_version,
            dimension,
            ids,
            slab,
            graph,
            built_at_ms,
        }
    }

    /// An empty snapshot for a fresh index.
    pub(crate) fn empty(model_version: String, dimension: usize, built_at_ms: i64) -> Self {
        Self::assemble(model_version, dimension, Vec::new(), Vec::new(), None, built_at_ms)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn has_graph(&self) -> bool {
        self.graph.is_some()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub(crate) fn slab(&self) -> &[f32] {
        &self.slab
    }

    /// Vector at a row offset.
    pub fn vector_at(&self, row: u32) -> &[f32] {
        let start = row as usize * self.dimension;
        &self.slab[start..start + self.dimension]
    }

    /// Id at a row offset.
    pub fn id_at(&self, row: u32) -> &str {
        &self.ids[row as usize]
    }

    /// Row offset of an id, if present.
    pub fn row_of(&self, id: &str) -> Option<u32> {
        self.ids.iter().position(|x| x == id).map(|i| i as u32)
    }

    /// k-NN over the snapshot: graph search when a graph exists, otherwise
    /// an exact scan. Returns `(row, distance)` ascending by distance, with
    /// row order as the final tie-breaker for reproducibility.
    pub fn search(&self, query: &[f32], k: usize, ef_search: usize) -> Vec<(u32, f32)> {
        if k == 0 || self.is_empty() {
            return Vec::new();
        }
        match &self.graph {
            Some(graph) => graph.search(self, query, k, ef_search),
            None => self.exact_search(query, k),
        }
    }

    /// Exact linear scan with a bounded heap; parallelized above
    /// [`PARALLEL_THRESHOLD`] rows.
    pub fn exact_search(&self, query: &[f32], k: usize) -> Vec<(u32, f32)> {
        if k == 0 || self.is_empty() {
            return Vec::new();
        }

        let rows = self.len();
        let heap = if rows >= PARALLEL_THRESHOLD {
            (0..rows)
                .into_par_iter()
                .with_min_len(PARALLEL_CHUNK_SIZE)
                .fold(BinaryHeap::new, |mut heap: BinaryHeap<HeapEntry>, row| {
                    let d = cosine_distance(query, self.vector_at(row as u32));
                    push_bounded(&mut heap, HeapEntry { distance: d, row: row as u32 }, k);
                    heap
                })
                .reduce(BinaryHeap::new, |mut a, b| {
                    for entry in b {
                        push_bounded(&mut a, entry, k);
                    }
                    a
                })
        } else {
            let mut heap = BinaryHeap::new();
            for row in 0..rows {
                let d = cosine_distance(query, self.vector_at(row as u32));
                push_bounded(&mut heap, HeapEntry { distance: d, row: row as u32 }, k);
            }
            heap
        };

        let mut out: Vec<(u32, f32)> = heap
            .into_iter()
            .map(|e| (e.row, e.distance))
            .collect();
        out.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        out
    }
}

fn push_bounded(heap: &mut BinaryHeap<HeapEntry>, entry: HeapEntry, k: usize) {
    if heap.len() < k {
        heap.push(entry);
    } else if let Some(worst) = heap.peek() {
        if entry < *worst {
            heap.pop();
            heap.push(entry);
        }
    }
}
