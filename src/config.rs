//! Engine configuration with documented defaults and environment overrides.
//!
//! Every tunable the policy sections of the engine depend on (ANN parameters,
//! cache admission/eviction, router scoring coefficients, pool sizing) lives
//! here rather than being hard-coded at the point of use. Overrides are read
//! from `PARTSEEK_*` environment variables via [`EngineConfig::from_env`].

use std::time::Duration;

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Embedding dimension the index is fixed to.
    pub dimension: usize,

    // -- Vector index --
    /// Below this vector count, queries use the exact linear scan.
    pub ann_threshold: usize,
    /// Max neighbors per HNSW graph node (construction quality knob).
    pub hnsw_m: usize,
    /// Candidate list size during graph construction.
    pub hnsw_ef_construction: usize,
    /// Candidate list size during graph search (recall/latency knob).
    pub hnsw_ef_search: usize,
    /// Snapshots older than this are served with a staleness warning.
    pub freshness_bound: Duration,

    // -- Adaptive cache --
    /// Total cache memory budget in bytes.
    pub cache_budget_bytes: usize,
    /// Number of cache shards.
    pub cache_shards: usize,
    /// Entry time-to-live.
    pub cache_ttl: Duration,
    /// Admit an entry once its windowed access frequency reaches this count.
    pub cache_admit_frequency: u32,
    /// Admit regardless of frequency when recomputation cost is at least this.
    pub cache_admit_cost: Duration,
    /// Eviction candidates sampled per pass (avoids full scans).
    pub cache_evict_sample: usize,
    /// Interval between background eviction passes.
    pub cache_evict_interval: Duration,

    // -- Resource router --
    /// Weight of inverse load in the selection score.
    pub router_load_weight: f64,
    /// Weight of inverse smoothed latency in the selection score.
    pub router_latency_weight: f64,
    /// Weight of the health factor in the selection score.
    pub router_health_weight: f64,
    /// EWMA smoothing factor for load/latency metrics.
    pub router_ewma_alpha: f64,
    /// Slow/error observations before a worker turns Degraded.
    pub degraded_after: u32,
    /// Consecutive heartbeat failures before a worker turns Unhealthy.
    pub unhealthy_after: u32,
    /// Error rate at or above which a worker turns Unhealthy.
    pub unhealthy_error_rate: f64,
    /// Consecutive successful heartbeats required to recover to Healthy.
    pub recovery_streak: u32,

    // -- Ranker --
    /// Weight of vector similarity in the composite score.
    pub rank_similarity_weight: f64,
    /// Weight of relational filter match in the composite score.
    pub rank_filter_weight: f64,
    /// Weight of the usage prior in the composite score.
    pub rank_usage_weight: f64,

    // -- Request pool --
    /// Worker threads executing queries.
    pub pool_workers: usize,
    /// Bounded request queue depth; beyond this, requests get `Overload`.
    pub pool_queue_depth: usize,
    /// Default query deadline when the caller does not supply one.
    pub default_deadline: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dimension: 256,
            ann_threshold: 2_000,
            hnsw_m: 16,
            hnsw_ef_construction: 200,
            hnsw_ef_search: 100,
            freshness_bound: Duration::from_secs(600),
            cache_budget_bytes: 32 * 1024 * 1024,
            cache_shards: 8,
            cache_ttl: Duration::from_secs(300),
            cache_admit_frequency: 2,
            cache_admit_cost: Duration::from_millis(25),
            cache_evict_sample: 8,
            cache_evict_interval: Duration::from_millis(500),
            router_load_weight: 0.45,
            router_latency_weight: 0.35,
            router_health_weight: 0.20,
            router_ewma_alpha: 0.3,
            degraded_after: 3,
            unhealthy_after: 5,
            unhealthy_error_rate: 0.5,
            recovery_streak: 3,
            rank_similarity_weight: 0.6,
            rank_filter_weight: 0.25,
            rank_usage_weight: 0.15,
            pool_workers: 4,
            pool_queue_depth: 64,
            default_deadline: Duration::from_millis(1_000),
        }
    }
}

impl EngineConfig {
    /// Load config with environment overrides applied on top of defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_parse::<usize>("PARTSEEK_DIMENSION") {
            cfg.dimension = v;
        }
        if let Some(v) = env_parse::<usize>("PARTSEEK_ANN_THRESHOLD") {
            cfg.ann_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("PARTSEEK_HNSW_M") {
            cfg.hnsw_m = v;
        }
        if let Some(v) = env_parse::<usize>("PARTSEEK_HNSW_EF_CONSTRUCTION") {
            cfg.hnsw_ef_construction = v;
        }
        if let Some(v) = env_parse::<usize>("PARTSEEK_HNSW_EF_SEARCH") {
            cfg.hnsw_ef_search = v;
        }
        if let Some(v) = env_parse::<u64>("PARTSEEK_FRESHNESS_BOUND_SECS") {
            cfg.freshness_bound = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("PARTSEEK_CACHE_BUDGET_BYTES") {
            cfg.cache_budget_bytes = v;
        }
        if let Some(v) = env_parse::<usize>("PARTSEEK_CACHE_SHARDS") {
            cfg.cache_shards = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("PARTSEEK_CACHE_TTL_SECS") {
            cfg.cache_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u32>("PARTSEEK_CACHE_ADMIT_FREQUENCY") {
            cfg.cache_admit_frequency = v;
        }
        if let Some(v) = env_parse::<u64>("PARTSEEK_CACHE_ADMIT_COST_MS") {
            cfg.cache_admit_cost = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<usize>("PARTSEEK_POOL_WORKERS") {
            cfg.pool_workers = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("PARTSEEK_POOL_QUEUE_DEPTH") {
            cfg.pool_queue_depth = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("PARTSEEK_DEFAULT_DEADLINE_MS") {
            cfg.default_deadline = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u32>("PARTSEEK_DEGRADED_AFTER") {
            cfg.degraded_after = v.max(1);
        }
        if let Some(v) = env_parse::<u32>("PARTSEEK_UNHEALTHY_AFTER") {
            cfg.unhealthy_after = v.max(1);
        }
        if let Some(v) = env_parse::<u32>("PARTSEEK_RECOVERY_STREAK") {
            cfg.recovery_streak = v.max(1);
        }

        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    dotenvy::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.hnsw_m, 16);
        assert_eq!(cfg.hnsw_ef_construction, 200);
        assert!(cfg.ann_threshold > 0);
        assert!(cfg.cache_shards > 0);
        // Scoring weights are convex combinations.
        let router = cfg.router_load_weight + cfg.router_latency_weight + cfg.router_health_weight;
        assert!((router - 1.0).abs() < 1e-9);
        let rank = cfg.rank_similarity_weight + cfg.rank_filter_weight + cfg.rank_usage_weight;
        assert!((rank - 1.0).abs() < 1e-9);
    }
}
