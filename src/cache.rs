//! Adaptive result cache.
//!
//! Computed result sets are cached under the normalized query + filter
//! signature key. Admission is earned, not automatic: an entry gets in when
//! its access frequency within the sliding window clears a threshold, or
//! when recomputing it would cost more than the configured bound; otherwise
//! `put` is a silent no-op and the cache stays bounded without an explicit
//! reject error.
//!
//! The store is sharded so concurrent requests touch independent locks, and
//! eviction works on samples from the cold end of each shard — never a full
//! scan, never a global pause. TTL expiry applies regardless of frequency.
//! Staleness from record changes is handled by the explicit
//! [`AdaptiveCache::invalidate`] hook, not detection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::model::SearchHit;

/// Counting-sketch width (counters per row); power of two for cheap masking.
const SKETCH_WIDTH: usize = 4096;

/// Probes per key.
const SKETCH_DEPTH: usize = 4;

/// Recorded accesses before every counter is halved — the sliding window.
const SKETCH_WINDOW_OPS: u32 = 8192;

/// Approximate frequency sketch with periodic halving, so counts reflect a
/// sliding window without per-key bookkeeping.
struct FrequencySketch {
    counters: Vec<u8>,
    ops: u32,
}

impl FrequencySketch {
    fn new() -> Self {
        Self {
            counters: vec![0; SKETCH_WIDTH * SKETCH_DEPTH],
            ops: 0,
        }
    }

    fn slots(key: u64) -> [usize; SKETCH_DEPTH] {
        let mut slots = [0usize; SKETCH_DEPTH];
        let mut h = key;
        for slot in &mut slots {
            h = h.wrapping_mul(0x9E3779B97F4A7C15).rotate_left(17) ^ key;
            *slot = (h as usize) & (SKETCH_WIDTH - 1);
        }
        slots
    }

    fn record(&mut self, key: u64) {
        for (row, slot) in Self::slots(key).into_iter().enumerate() {
            let c = &mut self.counters[row * SKETCH_WIDTH + slot];
            *c = c.saturating_add(1);
        }
        self.ops += 1;
        if self.ops >= SKETCH_WINDOW_OPS {
            self.age();
        }
    }

    fn estimate(&self, key: u64) -> u32 {
        Self::slots(key)
            .into_iter()
            .enumerate()
            .map(|(row, slot)| self.counters[row * SKETCH_WIDTH + slot] as u32)
            .min()
            .unwrap_or(0)
    }

    fn age(&mut self) {
        for c in &mut self.counters {
            *c >>= 1;
        }
        self.ops = 0;
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: Arc<Vec<SearchHit>>,
    cost_bytes: usize,
    expires_at: Instant,
}

fn entry_cost(value: &[SearchHit]) -> usize {
    // Rough accounting: string payloads plus fixed per-hit overhead.
    value
        .iter()
        .map(|h| h.id.len() + h.label.len() + h.matched_fields.iter().map(String::len).sum::<usize>() + 64)
        .sum::<usize>()
        + 64
}

struct Shard {
    map: LruCache<u64, CacheEntry>,
    bytes: usize,
}

impl Shard {
    fn remove(&mut self, key: u64) -> Option<CacheEntry> {
        let entry = self.map.pop(&key)?;
        self.bytes = self.bytes.saturating_sub(entry.cost_bytes);
        Some(entry)
    }
}

/// Sharded, frequency-admitted, TTL-bounded result cache.
pub struct AdaptiveCache {
    shards: Vec<Mutex<Shard>>,
    sketch: Mutex<FrequencySketch>,
    budget_per_shard: usize,
    ttl: Duration,
    admit_frequency: u32,
    admit_cost: Duration,
    evict_sample: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AdaptiveCache {
    pub fn new(cfg: &EngineConfig) -> Self {
        let shard_count = cfg.cache_shards.max(1);
        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(Shard {
                    map: LruCache::unbounded(),
                    bytes: 0,
                })
            })
            .collect();
        Self {
            shards,
            sketch: Mutex::new(FrequencySketch::new()),
            budget_per_shard: (cfg.cache_budget_bytes / shard_count).max(1),
            ttl: cfg.cache_ttl,
            admit_frequency: cfg.cache_admit_frequency,
            admit_cost: cfg.cache_admit_cost,
            evict_sample: cfg.cache_evict_sample.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, key: u64) -> &Mutex<Shard> {
        &self.shards[(key as usize) % self.shards.len()]
    }

    /// Look up a result set. Every lookup feeds the frequency window, so a
    /// key that keeps missing eventually earns admission.
    pub fn get(&self, key: u64) -> Option<Arc<Vec<SearchHit>>> {
        self.sketch.lock().record(key);

        let now = Instant::now();
        let mut shard = self.shard_for(key).lock();
        let expired = shard.map.peek(&key).is_some_and(|e| e.expires_at <= now);
        if expired {
            // Expired; drop it on the way out.
            shard.remove(key);
        }
        let value = shard.map.get(&key).map(|e| e.value.clone());
        drop(shard);

        match value {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Offer a computed result set. Admitted when the key's windowed
    /// frequency clears the threshold or the recomputation cost clears the
    /// cost bound; otherwise a no-op. Re-putting an existing key refreshes
    /// it, which makes late puts from abandoned queries harmless.
    pub fn put(&self, key: u64, value: Arc<Vec<SearchHit>>, recompute_cost: Duration) {
        let frequency = self.sketch.lock().estimate(key);
        if frequency < self.admit_frequency && recompute_cost < self.admit_cost {
            tracing::debug!(key, frequency, "cache admission declined");
            return;
        }

        let cost_bytes = entry_cost(&value);
        let entry = CacheEntry {
            value,
            cost_bytes,
            expires_at: Instant::now() + self.ttl,
        };

        let mut shard = self.shard_for(key).lock();
        if let Some(old) = shard.map.pop(&key) {
            shard.bytes = shard.bytes.saturating_sub(old.cost_bytes);
        }
        shard.bytes += cost_bytes;
        shard.map.put(key, entry);

        if shard.bytes > self.budget_per_shard {
            self.evict_from(&mut shard, key);
        }
    }

    /// Drop every cached result set that references the given record id.
    /// Called when the underlying record changes; the cache does not detect
    /// staleness on its own.
    pub fn invalidate(&self, id: &str) {
        let mut removed = 0usize;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let doomed: Vec<u64> = shard
                .map
                .iter()
                .filter(|(_, entry)| entry.value.iter().any(|hit| hit.id == id))
                .map(|(key, _)| *key)
                .collect();
            for key in doomed {
                shard.remove(key);
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(id, removed, "invalidated cache entries");
        }
    }

    /// One cooperative eviction pass: per shard, sample the cold end and
    /// drop expired entries, then enforce the byte budget. Runs from the
    /// background task; safe alongside foreground access.
    pub fn evict_pass(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            let now = Instant::now();
            let expired: Vec<u64> = shard
                .map
                .iter()
                .rev()
                .take(self.evict_sample)
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(key, _)| *key)
                .collect();
            for key in expired {
                shard.remove(key);
            }
            self.enforce_budget(&mut shard, None);
        }
    }

    fn evict_from(&self, shard: &mut Shard, protect: u64) {
        self.enforce_budget(shard, Some(protect));
    }

    /// Evict until the shard is within budget: expired entries first, then
    /// the lowest-frequency member of a cold-end sample.
    fn enforce_budget(&self, shard: &mut Shard, protect: Option<u64>) {
        while shard.bytes > self.budget_per_shard && shard.map.len() > 1 {
            let now = Instant::now();
            let sample: Vec<(u64, bool)> = shard
                .map
                .iter()
                .rev()
                .take(self.evict_sample)
                .filter(|(key, _)| Some(**key) != protect)
                .map(|(key, entry)| (*key, entry.expires_at <= now))
                .collect();
            if sample.is_empty() {
                break;
            }

            let victim = sample
                .iter()
                .find(|(_, expired)| *expired)
                .map(|(key, _)| *key)
                .or_else(|| {
                    let sketch = self.sketch.lock();
                    sample
                        .iter()
                        .map(|(key, _)| (*key, sketch.estimate(*key)))
                        .min_by_key(|&(_, freq)| freq)
                        .map(|(key, _)| key)
                });

            match victim {
                Some(key) => {
                    shard.remove(key);
                    tracing::debug!(key, "evicted cache entry");
                }
                None => break,
            }
        }
    }

    /// Fraction of lookups served from cache, in [0, 1].
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }

    /// Current approximate memory footprint in bytes.
    pub fn bytes(&self) -> usize {
        self.shards.iter().map(|s| s.lock().bytes).sum()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().map.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str) -> SearchHit {
        SearchHit {
            id: id.into(),
            label: id.into(),
            score: 0.5,
            matched_fields: vec!["vector".into()],
        }
    }

    fn cache_with(cfg_mut: impl FnOnce(&mut EngineConfig)) -> AdaptiveCache {
        let mut cfg = EngineConfig::default();
        cfg_mut(&mut cfg);
        AdaptiveCache::new(&cfg)
    }

    #[test]
    fn cost_admitted_put_round_trips() {
        let cache = cache_with(|_| {});
        let value = Arc::new(vec![hit("a")]);
        // Costly to recompute: admitted regardless of frequency.
        cache.put(1, value.clone(), Duration::from_millis(100));
        let got = cache.get(1).expect("admitted entry");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "a");
    }

    #[test]
    fn cold_cheap_put_is_a_no_op() {
        let cache = cache_with(|_| {});
        cache.put(2, Arc::new(vec![hit("a")]), Duration::from_millis(1));
        assert!(cache.get(2).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn frequent_key_earns_admission() {
        let cache = cache_with(|cfg| cfg.cache_admit_frequency = 2);
        // Two misses push the key's windowed frequency to the threshold.
        assert!(cache.get(3).is_none());
        assert!(cache.get(3).is_none());
        cache.put(3, Arc::new(vec![hit("b")]), Duration::from_millis(1));
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = cache_with(|cfg| cfg.cache_ttl = Duration::from_millis(10));
        cache.put(4, Arc::new(vec![hit("a")]), Duration::from_secs(1));
        assert!(cache.get(4).is_some());
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get(4).is_none());
    }

    #[test]
    fn invalidate_removes_entries_referencing_id() {
        let cache = cache_with(|_| {});
        cache.put(5, Arc::new(vec![hit("keep")]), Duration::from_secs(1));
        cache.put(6, Arc::new(vec![hit("gone"), hit("other")]), Duration::from_secs(1));

        cache.invalidate("gone");
        assert!(cache.get(5).is_some());
        assert!(cache.get(6).is_none());
    }

    #[test]
    fn budget_is_enforced_on_put() {
        let cache = cache_with(|cfg| {
            cfg.cache_shards = 1;
            cfg.cache_budget_bytes = 600;
        });
        for key in 0..20u64 {
            cache.put(key, Arc::new(vec![hit(&format!("part-{key}"))]), Duration::from_secs(1));
        }
        assert!(cache.bytes() <= 600 + 200, "bytes = {}", cache.bytes());
        assert!(cache.len() < 20);
    }

    #[test]
    fn evict_pass_drops_expired_entries() {
        let cache = cache_with(|cfg| cfg.cache_ttl = Duration::from_millis(5));
        cache.put(7, Arc::new(vec![hit("a")]), Duration::from_secs(1));
        std::thread::sleep(Duration::from_millis(15));
        cache.evict_pass();
        assert!(cache.is_empty());
    }

    #[test]
    fn hit_rate_tracks_lookups() {
        let cache = cache_with(|_| {});
        cache.put(8, Arc::new(vec![hit("a")]), Duration::from_secs(1));
        let _ = cache.get(8); // hit
        let _ = cache.get(9); // miss
        let rate = cache.hit_rate();
        assert!((rate - 0.5).abs() < 1e-9);
    }
}
