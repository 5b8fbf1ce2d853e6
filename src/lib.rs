pub mod cache;
pub mod config;
pub mod dispatch;
pub mod embed;
pub mod engine;
pub mod error;
pub mod index;
pub mod model;
pub mod query;
pub mod rank;
pub mod router;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use crate::config::EngineConfig;
use crate::engine::SearchEngine;
use crate::model::{PartFilters, PartRecord, QueryContext, SequenceKind};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "partseek",
    version,
    about = "Embedding-based retrieval over synthetic biology part records"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest part records from a JSON file
    Ingest {
        /// Path to a JSON array of part records
        records: PathBuf,

        /// Write the resulting index snapshot to this path
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Run a ranked search
    Search {
        /// Query text (may be empty when filters are given)
        query: String,

        /// Records file to ingest before searching
        #[arg(long)]
        records: Option<PathBuf>,

        /// Restore a saved index snapshot before searching
        #[arg(long)]
        index: Option<PathBuf>,

        /// Restrict to sequence kinds: dna, protein, other (repeatable)
        #[arg(long = "kind")]
        kinds: Vec<String>,

        /// Hierarchy level constraints, most general first (repeatable)
        #[arg(long = "level")]
        levels: Vec<String>,

        /// Metadata constraints as key=value (repeatable)
        #[arg(long = "meta")]
        meta: Vec<String>,

        /// Number of results
        #[arg(long, default_value_t = 10)]
        top_k: usize,

        /// Per-query deadline in milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,
    },
    /// Print engine statistics as JSON
    Stats {
        /// Records file to ingest before reporting
        #[arg(long)]
        records: Option<PathBuf>,

        /// Restore a saved index snapshot before reporting
        #[arg(long)]
        index: Option<PathBuf>,
    },
    /// List operations, or invoke one with JSON arguments
    Ops {
        /// Operation name; omit to list the registry
        name: Option<String>,

        /// JSON arguments for the operation
        #[arg(long, default_value = "{}")]
        args: String,

        /// Records file to ingest before invoking
        #[arg(long)]
        records: Option<PathBuf>,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let cfg = EngineConfig::from_env();

    match cli.command {
        Commands::Ingest { records, save } => {
            let engine = SearchEngine::new(cfg);
            let outcome = engine.ingest(load_records(&records)?);
            if let Some(path) = save {
                engine.save_index(&path)?;
            }
            println!(
                "{}",
                serde_json::json!({
                    "inserted": outcome.inserted,
                    "replaced": outcome.replaced,
                    "rejected": outcome.rejected,
                })
            );
            Ok(())
        }
        Commands::Search {
            query,
            records,
            index,
            kinds,
            levels,
            meta,
            top_k,
            deadline_ms,
        } => {
            let engine = build_engine(cfg, records.as_deref(), index.as_deref())?;
            let filters = parse_filters(&kinds, &levels, &meta)?;
            let budget = deadline_ms
                .map(Duration::from_millis)
                .unwrap_or(engine.config().default_deadline);
            let ctx = QueryContext::new(query, filters, top_k, budget);
            let response = engine.search(ctx)?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Commands::Stats { records, index } => {
            let engine = build_engine(cfg, records.as_deref(), index.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&engine.stats())?);
            Ok(())
        }
        Commands::Ops {
            name,
            args,
            records,
        } => {
            let Some(name) = name else {
                for op in dispatch::OPERATIONS {
                    println!("{:<20} {}", op.name, op.description);
                }
                return Ok(());
            };
            let engine = build_engine(cfg, records.as_deref(), None)?;
            let args: serde_json::Value =
                serde_json::from_str(&args).context("parse --args as JSON")?;
            let result = dispatch::dispatch(&engine, &name, args)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}

fn build_engine(
    cfg: EngineConfig,
    records: Option<&Path>,
    index: Option<&Path>,
) -> Result<SearchEngine> {
    let engine = SearchEngine::new(cfg);
    if let Some(path) = index {
        engine.load_index(path)?;
    }
    if let Some(path) = records {
        let outcome = engine.ingest(load_records(path)?);
        tracing::info!(
            inserted = outcome.inserted,
            replaced = outcome.replaced,
            rejected = outcome.rejected,
            "ingested records"
        );
    }
    Ok(engine)
}

fn load_records(path: &Path) -> Result<Vec<PartRecord>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("open records file {}", path.display()))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("parse records file {}", path.display()))
}

fn parse_filters(kinds: &[String], levels: &[String], meta: &[String]) -> Result<PartFilters> {
    let mut filters = PartFilters::default();
    for kind in kinds {
        let parsed = match kind.to_ascii_lowercase().as_str() {
            "dna" => SequenceKind::Dna,
            "protein" => SequenceKind::Protein,
            "other" => SequenceKind::Other,
            other => bail!("unknown sequence kind '{other}' (expected dna, protein, other)"),
        };
        filters.kinds.insert(parsed);
    }
    filters.hierarchy = levels.to_vec();
    for pair in meta {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("metadata constraint '{pair}' is not key=value");
        };
        filters.metadata.insert(key.to_string(), value.to_string());
    }
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_parse_from_cli_shapes() {
        let filters = parse_filters(
            &["dna".into(), "PROTEIN".into()],
            &["Promoter".into()],
            &["chassis=e-coli".into()],
        )
        .unwrap();
        assert!(filters.kinds.contains(&SequenceKind::Dna));
        assert!(filters.kinds.contains(&SequenceKind::Protein));
        assert_eq!(filters.hierarchy, vec!["Promoter"]);
        assert_eq!(
            filters.metadata.get("chassis").map(String::as_str),
            Some("e-coli")
        );
    }

    #[test]
    fn bad_kind_and_meta_are_rejected() {
        assert!(parse_filters(&["rna".into()], &[], &[]).is_err());
        assert!(parse_filters(&[], &[], &["novalue".into()]).is_err());
    }
}
