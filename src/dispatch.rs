//! Static operation registry.
//!
//! Every externally invokable operation is an entry in [`OPERATIONS`]: a
//! name, a short description, and a typed handler that deserializes its JSON
//! arguments up front. Dispatch is a linear walk of the table, so the full
//! surface is enumerable (for `partseek ops`) without any reflection.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::engine::SearchEngine;
use crate::model::{PartFilters, PartRecord, QueryContext};
use crate::router::Heartbeat;

pub struct Operation {
    pub name: &'static str,
    pub description: &'static str,
    pub handler: fn(&SearchEngine, Value) -> Result<Value>,
}

/// Static registry of all supported operations.
pub static OPERATIONS: &[Operation] = &[
    Operation {
        name: "search",
        description: "Run a ranked search: {query, filters?, top_k?, deadline_ms?}",
        handler: op_search,
    },
    Operation {
        name: "ingest",
        description: "Ingest a batch of part records: {records: [...]}",
        handler: op_ingest,
    },
    Operation {
        name: "feedback",
        description: "Record a result selection: {id, success?}",
        handler: op_feedback,
    },
    Operation {
        name: "stats",
        description: "Engine statistics (index, cache, latency, workers)",
        handler: op_stats,
    },
    Operation {
        name: "register-worker",
        description: "Register a worker backend: {id, address}",
        handler: op_register_worker,
    },
    Operation {
        name: "heartbeat",
        description: "Apply a heartbeat: {id, ok, load?, latency_ms?}",
        handler: op_heartbeat,
    },
    Operation {
        name: "deregister-worker",
        description: "Remove a worker backend: {id}",
        handler: op_deregister_worker,
    },
];

/// Find an operation by name.
pub fn find(name: &str) -> Option<&'static Operation> {
    OPERATIONS.iter().find(|op| op.name == name)
}

/// Invoke a named operation with JSON arguments.
pub fn dispatch(engine: &SearchEngine, name: &str, args: Value) -> Result<Value> {
    let Some(op) = find(name) else {
        bail!(
            "unknown operation '{name}' (known: {})",
            OPERATIONS
                .iter()
                .map(|op| op.name)
                .collect::<Vec<_>>()
                .join(", ")
        );
    };
    (op.handler)(engine, args)
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    filters: PartFilters,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default)]
    deadline_ms: Option<u64>,
}

fn default_top_k() -> usize {
    10
}

fn op_search(engine: &SearchEngine, args: Value) -> Result<Value> {
    let args: SearchArgs = serde_json::from_value(args).context("parse search arguments")?;
    let budget = args
        .deadline_ms
        .map(Duration::from_millis)
        .unwrap_or(engine.config().default_deadline);
    let ctx = QueryContext::new(args.query, args.filters, args.top_k, budget);
    let response = engine.search(ctx)?;
    Ok(serde_json::to_value(response)?)
}

#[derive(Deserialize)]
struct IngestArgs {
    records: Vec<PartRecord>,
}

fn op_ingest(engine: &SearchEngine, args: Value) -> Result<Value> {
    let args: IngestArgs = serde_json::from_value(args).context("parse ingest arguments")?;
    let outcome = engine.ingest(args.records);
    Ok(json!({
        "inserted": outcome.inserted,
        "replaced": outcome.replaced,
        "rejected": outcome.rejected,
    }))
}

#[derive(Deserialize)]
struct FeedbackArgs {
    id: String,
    #[serde(default = "default_true")]
    success: bool,
}

fn default_true() -> bool {
    true
}

fn op_feedback(engine: &SearchEngine, args: Value) -> Result<Value> {
    let args: FeedbackArgs = serde_json::from_value(args).context("parse feedback arguments")?;
    engine.record_feedback(&args.id, args.success);
    Ok(json!({ "recorded": args.id }))
}

fn op_stats(engine: &SearchEngine, _args: Value) -> Result<Value> {
    Ok(serde_json::to_value(engine.stats())?)
}

#[derive(Deserialize)]
struct RegisterArgs {
    id: String,
    address: String,
}

fn op_register_worker(engine: &SearchEngine, args: Value) -> Result<Value> {
    let args: RegisterArgs = serde_json::from_value(args).context("parse register arguments")?;
    engine.register_worker(&args.id, &args.address);
    Ok(json!({ "registered": args.id }))
}

#[derive(Deserialize)]
struct HeartbeatArgs {
    id: String,
    ok: bool,
    #[serde(default)]
    load: f64,
    #[serde(default)]
    latency_ms: f64,
}

fn op_heartbeat(engine: &SearchEngine, args: Value) -> Result<Value> {
    let args: HeartbeatArgs = serde_json::from_value(args).context("parse heartbeat arguments")?;
    let hb = if args.ok {
        Heartbeat::Success {
            load: args.load,
            latency_ms: args.latency_ms,
        }
    } else {
        Heartbeat::Failure
    };
    engine.heartbeat(&args.id, hb);
    Ok(json!({ "applied": args.id }))
}

#[derive(Deserialize)]
struct DeregisterArgs {
    id: String,
}

fn op_deregister_worker(engine: &SearchEngine, args: Value) -> Result<Value> {
    let args: DeregisterArgs =
        serde_json::from_value(args).context("parse deregister arguments")?;
    engine.deregister_worker(&args.id);
    Ok(json!({ "deregistered": args.id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn engine() -> SearchEngine {
        SearchEngine::new(EngineConfig {
            dimension: 64,
            pool_workers: 2,
            ..EngineConfig::default()
        })
    }

    #[test]
    fn operation_names_are_unique() {
        let mut names: Vec<&str> = OPERATIONS.iter().map(|op| op.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), OPERATIONS.len());
    }

    #[test]
    fn unknown_operation_is_an_error_listing_known_names() {
        let engine = engine();
        let err = dispatch(&engine, "nope", json!({})).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("nope"));
        assert!(msg.contains("search"));
    }

    #[test]
    fn ingest_then_search_round_trips_through_json() {
        let engine = engine();
        let outcome = dispatch(
            &engine,
            "ingest",
            json!({
                "records": [{
                    "id": "BBa_J23100",
                    "label": "J23100",
                    "text": "strong constitutive promoter",
                    "type_hierarchy": ["Promoter"]
                }]
            }),
        )
        .unwrap();
        assert_eq!(outcome["inserted"], 1);

        let result = dispatch(&engine, "search", json!({ "query": "promoter" })).unwrap();
        let hits = result["hits"].as_array().unwrap();
        assert_eq!(hits[0]["id"], "BBa_J23100");
    }

    #[test]
    fn stats_operation_reports_worker_table() {
        let engine = engine();
        let stats = dispatch(&engine, "stats", json!({})).unwrap();
        assert_eq!(stats["workers"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn heartbeat_operation_drives_the_router() {
        let engine = engine();
        dispatch(
            &engine,
            "register-worker",
            json!({ "id": "remote-1", "address": "10.0.0.7:9000" }),
        )
        .unwrap();
        dispatch(
            &engine,
            "heartbeat",
            json!({ "id": "remote-1", "ok": true, "load": 0.2, "latency_ms": 12.0 }),
        )
        .unwrap();

        let stats = dispatch(&engine, "stats", json!({})).unwrap();
        let remote = stats["workers"]
            .as_array()
            .unwrap()
            .iter()
            .find(|w| w["id"] == "remote-1")
            .unwrap();
        assert_eq!(remote["state"], "healthy");
    }
}
