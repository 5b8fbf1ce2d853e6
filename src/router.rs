//! Load-aware request routing across worker backends.
//!
//! The router keeps a table of registered workers, updated asynchronously by
//! heartbeats and per-request observations, and read via a short lock on the
//! selection path. Each worker walks the state machine
//!
//! ```text
//! Registering -> Healthy <-> Degraded -> Unhealthy -> Removed
//! ```
//!
//! Degraded is entered after a small number of slow/error responses within
//! the observation window; Unhealthy after sustained consecutive heartbeat
//! failures or an error-rate breach; recovery to Healthy requires a
//! consecutive streak of successful heartbeats. Observation counters are
//! reset only at state transitions, never silently mid-window.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// Minimum window observations before the error-rate rule can fire.
const ERROR_RATE_MIN_SAMPLES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Registering,
    Healthy,
    Degraded,
    Unhealthy,
}

/// One heartbeat report from a worker backend.
#[derive(Debug, Clone, Copy)]
pub enum Heartbeat {
    /// The worker answered; metrics are its self-reported load (0..=1+) and
    /// the observed round-trip latency.
    Success { load: f64, latency_ms: f64 },
    /// The worker failed to answer.
    Failure,
}

/// Per-request outcome fed back by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Completed,
    Slow,
    Error,
}

#[derive(Debug, Clone)]
struct WorkerNode {
    address: String,
    state: WorkerState,
    load_ewma: f64,
    latency_ewma: f64,
    has_metrics: bool,
    hb_fail_streak: u32,
    hb_success_streak: u32,
    window_requests: u32,
    window_slow_or_error: u32,
    window_errors: u32,
}

impl WorkerNode {
    fn new(address: String) -> Self {
        Self {
            address,
            state: WorkerState::Registering,
            load_ewma: 0.0,
            latency_ewma: 0.0,
            has_metrics: false,
            hb_fail_streak: 0,
            hb_success_streak: 0,
            window_requests: 0,
            window_slow_or_error: 0,
            window_errors: 0,
        }
    }

    fn reset_window(&mut self) {
        self.window_requests = 0;
        self.window_slow_or_error = 0;
        self.window_errors = 0;
    }

    fn transition(&mut self, id: &str, next: WorkerState) {
        if self.state == next {
            return;
        }
        tracing::info!(worker = id, from = ?self.state, to = ?next, "worker state transition");
        self.state = next;
        self.reset_window();
        // A recovery streak is counted from the moment of demotion, so a
        // worker whose heartbeats kept succeeding while its requests failed
        // cannot bounce straight back to Healthy.
        if matches!(next, WorkerState::Degraded | WorkerState::Unhealthy) {
            self.hb_success_streak = 0;
            self.hb_fail_streak = 0;
        }
    }

    fn health_factor(&self) -> f64 {
        match self.state {
            WorkerState::Healthy => 1.0,
            WorkerState::Degraded => 0.5,
            WorkerState::Registering => 0.25,
            WorkerState::Unhealthy => 0.0,
        }
    }
}

/// Per-node stats for the observability surface.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub id: String,
    pub state: WorkerState,
    pub load: f64,
    pub latency_ewma: f64,
}

/// The selected backend for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedWorker {
    pub id: String,
    pub address: String,
}

pub struct WorkerRouter {
    nodes: RwLock<Vec<(String, WorkerNode)>>,
    /// Round-robin cursor for score ties.
    rr: AtomicUsize,
    ewma_alpha: f64,
    load_weight: f64,
    latency_weight: f64,
    health_weight: f64,
    degraded_after: u32,
    unhealthy_after: u32,
    unhealthy_error_rate: f64,
    recovery_streak: u32,
}

impl WorkerRouter {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            rr: AtomicUsize::new(0),
            ewma_alpha: cfg.router_ewma_alpha,
            load_weight: cfg.router_load_weight,
            latency_weight: cfg.router_latency_weight,
            health_weight: cfg.router_health_weight,
            degraded_after: cfg.degraded_after,
            unhealthy_after: cfg.unhealthy_after,
            unhealthy_error_rate: cfg.unhealthy_error_rate,
            recovery_streak: cfg.recovery_streak,
        }
    }

    /// Register a worker. Re-registering an existing id restarts it in
    /// `Registering` with fresh metrics.
    pub fn register_worker(&self, id: impl Into<String>, address: impl Into<String>) {
        let id = id.into();
        let address = address.into();
        let mut nodes = self.nodes.write();
        match nodes.iter_mut().find(|(nid, _)| *nid == id) {
            Some((_, node)) => *node = WorkerNode::new(address),
            None => nodes.push((id.clone(), WorkerNode::new(address))),
        }
        tracing::info!(worker = %id, "worker registered");
    }

    /// Remove a worker from the table entirely (the `Removed` state).
    pub fn deregister(&self, id: &str) {
        let mut nodes = self.nodes.write();
        let before = nodes.len();
        nodes.retain(|(nid, _)| nid != id);
        if nodes.len() < before {
            tracing::info!(worker = id, "worker deregistered");
        }
    }

    /// Apply a heartbeat outcome. Unknown ids are logged and ignored.
    pub fn heartbeat(&self, id: &str, hb: Heartbeat) {
        let mut nodes = self.nodes.write();
        let Some((_, node)) = nodes.iter_mut().find(|(nid, _)| nid == id) else {
            tracing::warn!(worker = id, "heartbeat for unknown worker");
            return;
        };

        match hb {
            Heartbeat::Success { load, latency_ms } => {
                node.hb_fail_streak = 0;
                node.hb_success_streak = node.hb_success_streak.saturating_add(1);
                if node.has_metrics {
                    node.load_ewma =
                        self.ewma_alpha * load + (1.0 - self.ewma_alpha) * node.load_ewma;
                    node.latency_ewma = self.ewma_alpha * latency_ms
                        + (1.0 - self.ewma_alpha) * node.latency_ewma;
                } else {
                    node.load_ewma = load;
                    node.latency_ewma = latency_ms;
                    node.has_metrics = true;
                }

                match node.state {
                    WorkerState::Registering => node.transition(id, WorkerState::Healthy),
                    WorkerState::Unhealthy => {
                        if node.hb_success_streak >= self.recovery_streak {
                            node.transition(id, WorkerState::Healthy);
                        }
                    }
                    WorkerState::Degraded => {
                        if node.hb_success_streak >= self.recovery_streak
                            && node.window_slow_or_error < self.degraded_after
                        {
                            node.transition(id, WorkerState::Healthy);
                        }
                    }
                    WorkerState::Healthy => {}
                }
            }
            Heartbeat::Failure => {
                node.hb_success_streak = 0;
                node.hb_fail_streak = node.hb_fail_streak.saturating_add(1);
                if node.hb_fail_streak >= self.unhealthy_after
                    && node.state != WorkerState::Unhealthy
                {
                    node.transition(id, WorkerState::Unhealthy);
                }
            }
        }
    }

    /// Feed back a per-request outcome observed by the dispatcher.
    pub fn record_observation(&self, id: &str, obs: Observation) {
        let mut nodes = self.nodes.write();
        let Some((_, node)) = nodes.iter_mut().find(|(nid, _)| nid == id) else {
            return;
        };

        node.window_requests = node.window_requests.saturating_add(1);
        match obs {
            Observation::Completed => {}
            Observation::Slow => {
                node.window_slow_or_error = node.window_slow_or_error.saturating_add(1);
            }
            Observation::Error => {
                node.window_slow_or_error = node.window_slow_or_error.saturating_add(1);
                node.window_errors = node.window_errors.saturating_add(1);
            }
        }

        match node.state {
            WorkerState::Healthy if node.window_slow_or_error >= self.degraded_after => {
                node.transition(id, WorkerState::Degraded);
            }
            WorkerState::Healthy | WorkerState::Degraded
                if node.window_requests >= ERROR_RATE_MIN_SAMPLES
                    && node.window_errors as f64 / node.window_requests as f64
                        >= self.unhealthy_error_rate =>
            {
                node.transition(id, WorkerState::Unhealthy);
            }
            _ => {}
        }
    }

    /// Pick the best backend for a request.
    ///
    /// Never returns an Unhealthy node while a Healthy or Degraded one
    /// exists; Registering nodes are used only as a last resort before
    /// giving up. All-Unhealthy (or empty) tables fail with
    /// [`EngineError::NoAvailableWorker`].
    pub fn select_worker(&self) -> EngineResult<SelectedWorker> {
        let nodes = self.nodes.read();

        let mut candidates: Vec<(&String, &WorkerNode, f64)> = nodes
            .iter()
            .filter(|(_, n)| matches!(n.state, WorkerState::Healthy | WorkerState::Degraded))
            .map(|(id, n)| (id, n, self.score(n)))
            .collect();
        if candidates.is_empty() {
            candidates = nodes
                .iter()
                .filter(|(_, n)| n.state == WorkerState::Registering)
                .map(|(id, n)| (id, n, self.score(n)))
                .collect();
        }
        if candidates.is_empty() {
            return Err(EngineError::NoAvailableWorker);
        }

        let best = candidates
            .iter()
            .map(|&(_, _, s)| s)
            .fold(f64::MIN, f64::max);
        let tied: Vec<&(&String, &WorkerNode, f64)> = candidates
            .iter()
            .filter(|(_, _, s)| (best - s).abs() < 1e-9)
            .collect();

        let pick = self.rr.fetch_add(1, Ordering::Relaxed) % tied.len();
        let (id, node, _) = tied[pick];
        Ok(SelectedWorker {
            id: (*id).clone(),
            address: node.address.clone(),
        })
    }

    fn score(&self, node: &WorkerNode) -> f64 {
        let inv_load = 1.0 / (1.0 + node.load_ewma.max(0.0));
        let inv_latency = 1.0 / (1.0 + node.latency_ewma.max(0.0) / 100.0);
        self.load_weight * inv_load
            + self.latency_weight * inv_latency
            + self.health_weight * node.health_factor()
    }

    pub fn stats(&self) -> Vec<WorkerStats> {
        self.nodes
            .read()
            .iter()
            .map(|(id, n)| WorkerStats {
                id: id.clone(),
                state: n.state,
                load: n.load_ewma,
                latency_ewma: n.latency_ewma,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}
