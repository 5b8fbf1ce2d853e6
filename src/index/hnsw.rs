//! HNSW graph for approximate nearest-neighbor search.
//!
//! The graph lives *inside* a snapshot and addresses vectors by arena row
//! offset, so publishing a rebuilt index swaps the graph and the slab
//! together. Node levels are derived deterministically from the record id
//! hash: the same batch always builds the same graph, which keeps recall
//! measurements and tests reproducible.
//!
//! Parameters follow the usual trade-offs: `m` bounds neighbors per node
//! (construction quality / memory), `ef_construction` is the candidate list
//! width at build time, and `ef_search` trades recall for latency per query.

use std::cmp::Ordering;

use crate::index::snapshot::{IndexSnapshot, cosine_distance};

/// Hard cap on node levels; beyond this the hierarchy stops paying off.
const MAX_LEVEL: usize = 12;

#[derive(Debug, Clone)]
struct Node {
    level: usize,
    /// Neighbor rows per level, `level + 1` lists.
    neighbors: Vec<Vec<u32>>,
}

/// Build-time inputs the graph needs from the (not yet assembled) snapshot.
pub(crate) struct GraphSource<'a> {
    pub ids: &'a [String],
    pub slab: &'a [f32],
    pub dimension: usize,
}

impl GraphSource<'_> {
    fn vector_at(&self, row: u32) -> &[f32] {
        let start = row as usize * self.dimension;
        &self.slab[start..start + self.dimension]
    }
}

#[derive(Debug)]
pub struct HnswGraph {
    nodes: Vec<Node>,
    entry: Option<u32>,
    max_level: usize,
    m: usize,
    level_mult: f64,
}

impl HnswGraph {
    /// Build a graph over every row of the source, inserting in row order.
    pub(crate) fn build(source: &GraphSource<'_>, m: usize, ef_construction: usize) -> Self {
        let mut graph = Self {
            nodes: Vec::with_capacity(source.ids.len()),
            entry: None,
            max_level: 0,
            m: m.max(2),
            level_mult: 1.0 / (m.max(2) as f64).ln(),
        };
        for row in 0..source.ids.len() as u32 {
            graph.insert(source, row, ef_construction);
        }
        graph
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Deterministic level from the id hash (no RNG, reproducible builds).
    fn level_for(&self, id: &str) -> usize {
        let h = fxhash::hash64(id.as_bytes());
        let uniform =
            ((h.wrapping_mul(6364136223846793005).wrapping_add(1)) as f64) / (u64::MAX as f64);
        let uniform = uniform.max(f64::MIN_POSITIVE);
        let level = (-uniform.ln() * self.level_mult) as usize;
        level.min(MAX_LEVEL)
    }

    fn insert(&mut self, source: &GraphSource<'_>, row: u32, ef_construction: usize) {
        let level = self.level_for(&source.ids[row as usize]);
        self.nodes.push(Node {
            level,
            neighbors: vec![Vec::new(); level + 1],
        });

        let Some(entry) = self.entry else {
            self.entry = Some(row);
            self.max_level = level;
            return;
        };

        let query = source.vector_at(row);

        // Greedy descent through layers above the insert level.
        let mut current = entry;
        for lev in ((level + 1)..=self.max_level).rev() {
            current = self.greedy_closest(source, current, query, lev);
        }

        // Connect on each layer from the insert level down.
        for lev in (0..=level.min(self.max_level)).rev() {
            let candidates = self.search_layer(source, current, query, ef_construction, lev);
            let selected: Vec<u32> = candidates.iter().take(self.m).map(|&(r, _)| r).collect();

            self.nodes[row as usize].neighbors[lev] = selected.clone();
            for nb in selected {
                let overfull = {
                    let nb_node = &mut self.nodes[nb as usize];
                    if lev < nb_node.neighbors.len() {
                        nb_node.neighbors[lev].push(row);
                        nb_node.neighbors[lev].len() > self.m * 2
                    } else {
                        false
                    }
                };
                if overfull {
                    self.prune(source, nb, lev);
                }
            }
            if let Some(&(best, _)) = candidates.first() {
                current = best;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry = Some(row);
        }
    }

    fn greedy_closest(
        &self,
        source: &GraphSource<'_>,
        mut current: u32,
        query: &[f32],
        level: usize,
    ) -> u32 {
        let mut best = cosine_distance(query, source.vector_at(current));
        loop {
            let mut improved = false;
            let node = &self.nodes[current as usize];
            if level < node.neighbors.len() {
                for &nb in &node.neighbors[level] {
                    let d = cosine_distance(query, source.vector_at(nb));
                    if d < best {
                        best = d;
                        current = nb;
                        improved = true;
                    }
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search over one layer; results sorted ascending by distance.
    fn search_layer(
        &self,
        source: &GraphSource<'_>,
        entry: u32,
        query: &[f32],
        ef: usize,
        level: usize,
    ) -> Vec<(u32, f32)> {
        let mut visited = vec![false; self.nodes.len()];
        visited[entry as usize] = true;
        let entry_dist = cosine_distance(query, source.vector_at(entry));

        let mut candidates: Vec<(u32, f32)> = vec![(entry, entry_dist)];
        let mut results: Vec<(u32, f32)> = vec![(entry, entry_dist)];

        loop {
            let Some((ci, &(c_row, c_dist))) = candidates
                .iter()
                .enumerate()
                .min_by(|a, b| cmp_dist(a.1.1, b.1.1))
            else {
                break;
            };

            let worst = results
                .iter()
                .map(|r| r.1)
                .fold(f32::MIN, f32::max);
            if c_dist > worst && results.len() >= ef {
                break;
            }
            candidates.swap_remove(ci);

            let node = &self.nodes[c_row as usize];
            if level >= node.neighbors.len() {
                continue;
            }
            for &nb in &node.neighbors[level] {
                if visited[nb as usize] {
                    continue;
                }
                visited[nb as usize] = true;
                let d = cosine_distance(query, source.vector_at(nb));
                let worst = results.iter().map(|r| r.1).fold(f32::MIN, f32::max);
                if d < worst || results.len() < ef {
                    candidates.push((nb, d));
                    results.push((nb, d));
                    if results.len() > ef {
                        results.sort_by(|a, b| cmp_dist(a.1, b.1));
                        results.truncate(ef);
                    }
                }
            }
        }

        results.sort_by(|a, b| cmp_dist(a.1, b.1).then_with(|| a.0.cmp(&b.0)));
        results
    }

    fn prune(&mut self, source: &GraphSource<'_>, row: u32, level: usize) {
        let anchor = source.vector_at(row).to_vec();
        let node = &mut self.nodes[row as usize];
        let mut scored: Vec<(u32, f32)> = node.neighbors[level]
            .iter()
            .map(|&nb| (nb, cosine_distance(&anchor, source.vector_at(nb))))
            .collect();
        scored.sort_by(|a, b| cmp_dist(a.1, b.1));
        scored.truncate(self.m);
        node.neighbors[level] = scored.into_iter().map(|(nb, _)| nb).collect();
    }

    /// Approximate k-NN against an assembled snapshot. Returns `(row,
    /// distance)` ascending, row order breaking exact ties.
    pub fn search(
        &self,
        snapshot: &IndexSnapshot,
        query: &[f32],
        k: usize,
        ef_search: usize,
    ) -> Vec<(u32, f32)> {
        let Some(entry) = self.entry else {
            return Vec::new();
        };
        let source = GraphSource {
            ids: snapshot.ids(),
            slab: snapshot.slab(),
            dimension: snapshot.dimension,
        };

        let mut current = entry;
        for lev in (1..=self.max_level).rev() {
            current = self.greedy_closest(&source, current, query, lev);
        }

        let mut results = self.search_layer(&source, current, query, ef_search.max(k), 0);
        results.truncate(k);
        results
    }
}

fn cmp_dist(a: f32, b: f32) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}
