//! The search engine facade.
//!
//! `SearchEngine` owns the vector index, the result cache, the worker router,
//! and a bounded thread pool that executes queries. The foreground path is
//! plan -> cache probe -> worker selection -> pooled execution with a
//! deadline; ingestion re-embeds changed records, invalidates their cached
//! results, and publishes a new index snapshot in one batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use fxhash::FxHashMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::cache::AdaptiveCache;
use crate::config::EngineConfig;
use crate::embed::{Embedder, HashEmbedder};
use crate::error::{EngineError, EngineResult};
use crate::index::{BatchOutcome, IndexStats, VectorIndex};
use crate::model::{PartFilters, PartRecord, QueryContext, SearchHit, SearchResponse, SequenceKind};
use crate::query::{self, QueryIntent, QueryPlan};
use crate::rank::{self, RankWeights, RankedCandidate};
use crate::router::{Heartbeat, Observation, WorkerRouter, WorkerStats};

/// Saturation constant for the usage prior: a record selected `n` times
/// scores `n / (n + SATURATION)`, approaching 1 without ever pinning there.
const USAGE_PRIOR_SATURATION: f64 = 5.0;

/// Vector candidates fetched per requested result, before filter and
/// composite re-ranking narrow them down.
const OVERFETCH_FACTOR: usize = 4;

#[derive(Debug, Default, Clone, Copy)]
struct UsageStats {
    selections: u64,
    successes: u64,
}

impl UsageStats {
    fn prior(&self) -> f64 {
        let n = self.selections as f64;
        n / (n + USAGE_PRIOR_SATURATION)
    }

    fn success_rate(&self) -> f64 {
        if self.selections == 0 {
            0.5
        } else {
            self.successes as f64 / self.selections as f64
        }
    }
}

/// Engine-wide statistics for the observability surface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub index: IndexStats,
    /// Record counts per sequence kind.
    pub kind_counts: BTreeMap<&'static str, usize>,
    pub cache_hit_rate: f64,
    pub cache_bytes: usize,
    pub cache_entries: usize,
    pub avg_query_latency_ms: f64,
    pub workers: Vec<WorkerStats>,
}

struct QueryJob {
    ctx: QueryContext,
    plan: QueryPlan,
    key: u64,
    reply: Sender<EngineResult<SearchResponse>>,
}

/// Shared internals, referenced by the facade and every pool worker.
struct EngineCore {
    cfg: EngineConfig,
    embedder: Arc<dyn Embedder>,
    index: VectorIndex,
    cache: AdaptiveCache,
    router: WorkerRouter,
    weights: RankWeights,
    records: RwLock<FxHashMap<String, Arc<PartRecord>>>,
    usage: RwLock<FxHashMap<String, UsageStats>>,
    latency_us: AtomicU64,
    latency_samples: AtomicU64,
}

impl EngineCore {
    fn record_latency(&self, elapsed_us: u64) {
        self.latency_us.fetch_add(elapsed_us, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    fn avg_latency_ms(&self) -> f64 {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        self.latency_us.load(Ordering::Relaxed) as f64 / samples as f64 / 1_000.0
    }

    fn usage_of(&self, id: &str) -> UsageStats {
        self.usage.read().get(id).copied().unwrap_or_default()
    }

    /// Execute one planned query against the current snapshot. Runs on a
    /// pool worker; the deadline is checked at stage boundaries so an
    /// abandoned query stops early instead of burning the pool.
    fn execute(&self, ctx: &QueryContext, plan: &QueryPlan, key: u64) -> EngineResult<SearchResponse> {
        let start = Instant::now();
        if ctx.expired() {
            return Err(timeout_for(ctx));
        }

        let snapshot = self.index.snapshot();
        let stale = self.index.is_stale(&snapshot);

        let hits = match plan.intent {
            QueryIntent::ExactId => {
                let exact = self.exact_lookup(&plan.normalized, &ctx.filters);
                if exact.is_empty() {
                    self.vector_search(ctx, plan)?
                } else {
                    exact
                }
            }
            QueryIntent::FilterHeavy => self.filter_scan(&ctx.filters, ctx.top_k),
            QueryIntent::Informational => self.vector_search(ctx, plan)?,
        };

        if ctx.expired() {
            return Err(timeout_for(ctx));
        }

        let hits = Arc::new(hits);
        self.cache.put(key, hits.clone(), start.elapsed());

        Ok(SearchResponse {
            hits: (*hits).clone(),
            stale,
        })
    }

    /// Case-insensitive id lookup for identifier-shaped queries.
    fn exact_lookup(&self, wanted: &str, filters: &PartFilters) -> Vec<SearchHit> {
        let records = self.records.read();
        let Some(record) = records
            .values()
            .find(|r| r.id.eq_ignore_ascii_case(wanted))
        else {
            return Vec::new();
        };
        if !filters.is_empty() && filters.match_score(record) == 0.0 {
            return Vec::new();
        }
        vec![SearchHit {
            id: record.id.clone(),
            label: record.label.clone(),
            score: 1.0,
            matched_fields: vec!["id".to_string()],
        }]
    }

    /// Filter-only path: no embedding, candidates ranked by filter match
    /// fraction and usage prior alone.
    fn filter_scan(&self, filters: &PartFilters, top_k: usize) -> Vec<SearchHit> {
        let records = self.records.read();
        let mut candidates: Vec<(Arc<PartRecord>, RankedCandidate)> = records
            .values()
            .filter_map(|record| {
                let fraction = filters.match_score(record);
                if !filters.is_empty() && fraction == 0.0 {
                    return None;
                }
                let usage = self.usage_of(&record.id);
                let composite = rank::combine(0.0, fraction, usage.prior(), &self.weights);
                Some((
                    record.clone(),
                    RankedCandidate {
                        id: record.id.clone(),
                        composite,
                        success_rate: usage.success_rate(),
                    },
                ))
            })
            .collect();

        candidates.sort_by(|a, b| rank::total_order(&a.1, &b.1));
        candidates.truncate(top_k);
        candidates
            .into_iter()
            .map(|(record, ranked)| SearchHit {
                id: ranked.id,
                label: record.label.clone(),
                score: ranked.composite,
                matched_fields: matched_fields(filters, &record, false),
            })
            .collect()
    }

    /// Vector path: embed the plan, overfetch neighbors, re-rank with the
    /// composite score, and cut to `top_k`.
    fn vector_search(&self, ctx: &QueryContext, plan: &QueryPlan) -> EngineResult<Vec<SearchHit>> {
        if ctx.top_k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embedder.encode(&plan.embedding_text());
        let fetch = ctx.top_k.saturating_mul(OVERFETCH_FACTOR).max(ctx.top_k);
        let neighbors = self.index.query(&vector, fetch)?;

        let records = self.records.read();
        let mut ranked: Vec<(Arc<PartRecord>, RankedCandidate)> = Vec::with_capacity(neighbors.len());
        for (id, distance) in neighbors {
            let Some(record) = records.get(&id) else {
                // Index row without a record: replaced mid-flight, skip.
                continue;
            };
            let fraction = ctx.filters.match_score(record);
            if !ctx.filters.is_empty() && fraction == 0.0 {
                continue;
            }
            // Unit vectors: distance = 1 - cos, so similarity in [0, 1]
            // is (2 - distance) / 2.
            let similarity = ((2.0 - distance as f64) / 2.0).clamp(0.0, 1.0);
            let usage = self.usage_of(&record.id);
            let composite = rank::combine(similarity, fraction, usage.prior(), &self.weights);
            ranked.push((
                record.clone(),
                RankedCandidate {
                    id: record.id.clone(),
                    composite,
                    success_rate: usage.success_rate(),
                },
            ));
        }
        drop(records);

        ranked.sort_by(|a, b| rank::total_order(&a.1, &b.1));
        ranked.truncate(ctx.top_k);
        Ok(ranked
            .into_iter()
            .map(|(record, candidate)| SearchHit {
                id: candidate.id,
                label: record.label.clone(),
                score: candidate.composite,
                matched_fields: matched_fields(&ctx.filters, &record, true),
            })
            .collect())
    }
}

fn timeout_for(ctx: &QueryContext) -> EngineError {
    EngineError::Timeout {
        deadline_ms: ctx.budget.as_millis() as u64,
    }
}

/// Which fields contributed to a hit: the vector signal (when used) plus
/// every satisfied filter axis.
fn matched_fields(filters: &PartFilters, record: &PartRecord, vector: bool) -> Vec<String> {
    let mut fields = Vec::new();
    if vector {
        fields.push("vector".to_string());
    }
    if !filters.kinds.is_empty() && filters.kinds.contains(&record.sequence_kind()) {
        fields.push("kind".to_string());
    }
    if filters
        .hierarchy
        .iter()
        .enumerate()
        .any(|(i, want)| !want.is_empty() && record.hierarchy_level(i + 1).eq_ignore_ascii_case(want))
    {
        fields.push("hierarchy".to_string());
    }
    if filters
        .metadata
        .iter()
        .any(|(k, want)| record.metadata.get(k).is_some_and(|v| v == want))
    {
        fields.push("metadata".to_string());
    }
    if fields.is_empty() {
        fields.push("vector".to_string());
    }
    fields
}

pub struct SearchEngine {
    core: Arc<EngineCore>,
    job_tx: Option<Sender<QueryJob>>,
    evict_tx: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
    evictor: Option<JoinHandle<()>>,
}

impl SearchEngine {
    pub fn new(cfg: EngineConfig) -> Self {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(cfg.dimension));
        Self::with_embedder(cfg, embedder)
    }

    pub fn with_embedder(cfg: EngineConfig, embedder: Arc<dyn Embedder>) -> Self {
        let index = VectorIndex::new(embedder.model_version(), &cfg);
        let cache = AdaptiveCache::new(&cfg);
        let router = WorkerRouter::new(&cfg);
        let weights = RankWeights::from_config(&cfg);

        // Local pool workers register as routable backends; external
        // backends can be added through the same router surface.
        for i in 0..cfg.pool_workers {
            let id = format!("local-{i}");
            router.register_worker(&id, "in-process");
            router.heartbeat(
                &id,
                Heartbeat::Success {
                    load: 0.0,
                    latency_ms: 0.0,
                },
            );
        }

        let core = Arc::new(EngineCore {
            cfg: cfg.clone(),
            embedder,
            index,
            cache,
            router,
            weights,
            records: RwLock::new(FxHashMap::default()),
            usage: RwLock::new(FxHashMap::default()),
            latency_us: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
        });

        let (job_tx, job_rx) = bounded::<QueryJob>(cfg.pool_queue_depth);
        let workers = (0..cfg.pool_workers)
            .map(|i| {
                let core = core.clone();
                let rx: Receiver<QueryJob> = job_rx.clone();
                std::thread::Builder::new()
                    .name(format!("partseek-worker-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            let result = core.execute(&job.ctx, &job.plan, job.key);
                            let _ = job.reply.send(result);
                        }
                    })
                    .expect("spawn pool worker")
            })
            .collect();

        let (evict_tx, evict_rx) = bounded::<()>(0);
        let evictor = {
            let core = core.clone();
            let interval = cfg.cache_evict_interval;
            std::thread::Builder::new()
                .name("partseek-evictor".to_string())
                .spawn(move || loop {
                    match evict_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => core.cache.evict_pass(),
                        _ => break,
                    }
                })
                .expect("spawn evictor")
        };

        Self {
            core,
            job_tx: Some(job_tx),
            evict_tx: Some(evict_tx),
            workers,
            evictor: Some(evictor),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.cfg
    }

    /// Ingest a batch of records: re-embed, invalidate cached results that
    /// reference them, and publish one new index snapshot. A bad record is
    /// skipped with a warning; the rest of the batch goes through.
    pub fn ingest(&self, batch: Vec<PartRecord>) -> BatchOutcome {
        let mut entries = Vec::with_capacity(batch.len());
        let mut accepted = Vec::with_capacity(batch.len());
        let mut rejected = 0usize;
        // Embedding and cache invalidation run outside the record lock so
        // concurrent reads are blocked only for the map inserts themselves.
        for record in batch {
            if record.id.is_empty() {
                tracing::warn!("skipping record with empty id");
                rejected += 1;
                continue;
            }
            let vector = self.core.embedder.encode(&record.text);
            self.core.cache.invalidate(&record.id);
            entries.push((record.id.clone(), vector));
            accepted.push(record);
        }
        {
            let mut records = self.core.records.write();
            for record in accepted {
                records.insert(record.id.clone(), Arc::new(record));
            }
        }
        let mut outcome = self.core.index.upsert_batch(entries);
        outcome.rejected += rejected;
        outcome
    }

    /// Run a search to completion or to its deadline, whichever comes first.
    pub fn search(&self, ctx: QueryContext) -> EngineResult<SearchResponse> {
        let start = Instant::now();
        let budget_ms = ctx.budget.as_millis() as u64;
        let plan = query::optimize(&ctx.raw, &ctx.filters);
        let key = query::cache_key(&plan, &ctx.filters, self.core.embedder.model_version(), ctx.top_k);

        if let Some(hits) = self.core.cache.get(key) {
            let snapshot = self.core.index.snapshot();
            self.core.record_latency(start.elapsed().as_micros() as u64);
            return Ok(SearchResponse {
                hits: (*hits).clone(),
                stale: self.core.index.is_stale(&snapshot),
            });
        }

        let worker = self.core.router.select_worker()?;
        let (reply_tx, reply_rx) = bounded(1);
        let job = QueryJob {
            ctx: ctx.clone(),
            plan,
            key,
            reply: reply_tx,
        };

        let Some(job_tx) = &self.job_tx else {
            return Err(EngineError::NoAvailableWorker);
        };
        match job_tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.core.router.record_observation(&worker.id, Observation::Slow);
                return Err(EngineError::Overload {
                    capacity: self.core.cfg.pool_queue_depth,
                });
            }
            Err(TrySendError::Disconnected(_)) => return Err(EngineError::NoAvailableWorker),
        }

        let wait = ctx.deadline.saturating_duration_since(Instant::now());
        match reply_rx.recv_timeout(wait) {
            Ok(Ok(response)) => {
                self.core.router.record_observation(&worker.id, Observation::Completed);
                self.core.record_latency(start.elapsed().as_micros() as u64);
                Ok(response)
            }
            Ok(Err(err)) => {
                let obs = match &err {
                    EngineError::Timeout { .. } => Observation::Slow,
                    _ => Observation::Error,
                };
                self.core.router.record_observation(&worker.id, obs);
                match err {
                    EngineError::Timeout { .. } => {
                        Err(EngineError::Timeout { deadline_ms: budget_ms })
                    }
                    other => Err(other),
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                self.core.router.record_observation(&worker.id, Observation::Slow);
                Err(EngineError::Timeout { deadline_ms: budget_ms })
            }
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::NoAvailableWorker),
        }
    }

    /// Record that a result was selected by the caller, feeding the usage
    /// prior and the success-rate tie-breaker.
    pub fn record_feedback(&self, id: &str, success: bool) {
        let mut usage = self.core.usage.write();
        let stats = usage.entry(id.to_string()).or_default();
        stats.selections += 1;
        if success {
            stats.successes += 1;
        }
    }

    pub fn record(&self, id: &str) -> Option<Arc<PartRecord>> {
        self.core.records.read().get(id).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.core.records.read().len()
    }

    pub fn stats(&self) -> EngineStats {
        let mut kind_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for record in self.core.records.read().values() {
            let kind = match record.sequence_kind() {
                SequenceKind::Dna => "dna",
                SequenceKind::Protein => "protein",
                SequenceKind::Other => "other",
            };
            *kind_counts.entry(kind).or_insert(0) += 1;
        }
        EngineStats {
            index: self.core.index.stats(),
            kind_counts,
            cache_hit_rate: self.core.cache.hit_rate(),
            cache_bytes: self.core.cache.bytes(),
            cache_entries: self.core.cache.len(),
            avg_query_latency_ms: self.core.avg_latency_ms(),
            workers: self.core.router.stats(),
        }
    }

    // Router pass-throughs for external backend management.

    pub fn register_worker(&self, id: &str, address: &str) {
        self.core.router.register_worker(id, address);
    }

    pub fn heartbeat(&self, id: &str, hb: Heartbeat) {
        self.core.router.heartbeat(id, hb);
    }

    pub fn deregister_worker(&self, id: &str) {
        self.core.router.deregister(id);
    }

    pub fn save_index(&self, path: &std::path::Path) -> anyhow::Result<()> {
        self.core.index.save(path)
    }

    /// Restore a persisted index snapshot. Records still come from the
    /// ingestion feed; only the derived vectors are loaded.
    pub fn load_index(&self, path: &std::path::Path) -> anyhow::Result<()> {
        self.core.index.restore(path)
    }
}

impl Drop for SearchEngine {
    fn drop(&mut self) {
        // Dropping the senders unblocks the pool and the evictor.
        self.job_tx.take();
        self.evict_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.evictor.take() {
            let _ = handle.join();
        }
    }
}
