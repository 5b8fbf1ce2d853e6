//! End-to-end search behavior through the public engine surface.

use std::collections::BTreeMap;
use std::time::Duration;

use partseek::config::EngineConfig;
use partseek::engine::SearchEngine;
use partseek::error::EngineError;
use partseek::model::{PartFilters, PartRecord, QueryContext, SequenceKind};

fn part(id: &str, text: &str, hierarchy: &[&str]) -> PartRecord {
    PartRecord {
        id: id.into(),
        label: format!("{id} label"),
        text: text.into(),
        sequence: String::new(),
        type_hierarchy: hierarchy.iter().map(|s| s.to_string()).collect(),
        metadata: BTreeMap::new(),
    }
}

fn engine() -> SearchEngine {
    SearchEngine::new(EngineConfig {
        dimension: 128,
        pool_workers: 2,
        ..EngineConfig::default()
    })
}

fn catalog() -> Vec<PartRecord> {
    vec![
        part(
            "BBa_J23100",
            "strong constitutive promoter driving transcription in e coli",
            &["Promoter", "Constitutive"],
        ),
        part(
            "BBa_R0010",
            "laci regulated inducible promoter repressed by lactose repressor",
            &["Promoter", "Inducible"],
        ),
        part(
            "BBa_B0034",
            "ribosome binding site with strong translation initiation rate",
            &["RBS"],
        ),
        part(
            "BBa_E0040",
            "green fluorescent protein gfp reporter coding sequence",
            &["Protein coding", "Reporter"],
        ),
        part(
            "BBa_C0012",
            "laci repressor protein coding sequence for lactose operon regulation",
            &["Protein coding", "Regulator"],
        ),
    ]
}

fn ctx(raw: &str, filters: PartFilters, top_k: usize) -> QueryContext {
    QueryContext::new(raw, filters, top_k, Duration::from_secs(5))
}

#[test]
fn text_query_ranks_on_topic_parts_first() {
    let engine = engine();
    engine.ingest(catalog());

    let response = engine
        .search(ctx("constitutive promoter", PartFilters::default(), 3))
        .unwrap();
    assert_eq!(response.hits[0].id, "BBa_J23100");
    assert!(!response.stale);

    // Scores come out in non-increasing order.
    for pair in response.hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[test]
fn kind_filter_separates_dna_from_protein() {
    let engine = engine();
    engine.ingest(catalog());

    let mut dna = PartFilters::default();
    dna.kinds.insert(SequenceKind::Dna);
    let response = engine.search(ctx("laci regulation", dna, 5)).unwrap();
    assert!(!response.hits.is_empty());
    // The protein-coding laci repressor is excluded; the regulated promoter
    // remains.
    assert!(response.hits.iter().any(|h| h.id == "BBa_R0010"));
    assert!(response.hits.iter().all(|h| h.id != "BBa_C0012"));

    let mut protein = PartFilters::default();
    protein.kinds.insert(SequenceKind::Protein);
    let response = engine.search(ctx("laci regulation", protein, 5)).unwrap();
    assert!(response.hits.iter().any(|h| h.id == "BBa_C0012"));
    assert!(response.hits.iter().all(|h| h.id != "BBa_R0010"));
}

#[test]
fn filter_only_query_returns_matches_without_text() {
    let engine = engine();
    engine.ingest(catalog());

    let mut filters = PartFilters::default();
    filters.hierarchy = vec!["promoter".into()];
    let response = engine.search(ctx("", filters, 10)).unwrap();

    let ids: Vec<&str> = response.hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"BBa_J23100"));
    assert!(ids.contains(&"BBa_R0010"));
    for hit in &response.hits {
        assert!(hit.matched_fields.contains(&"hierarchy".to_string()));
    }
}

#[test]
fn exact_id_lookup_wins_over_vector_search() {
    let engine = engine();
    engine.ingest(catalog());

    let response = engine
        .search(ctx("BBa_B0034", PartFilters::default(), 5))
        .unwrap();
    assert_eq!(response.hits.len(), 1);
    assert_eq!(response.hits[0].id, "BBa_B0034");
    assert_eq!(response.hits[0].matched_fields, vec!["id"]);
}

#[test]
fn feedback_shifts_ties_toward_used_parts() {
    let engine = engine();
    engine.ingest(catalog());

    let mut filters = PartFilters::default();
    filters.hierarchy = vec!["promoter".into()];

    for _ in 0..20 {
        engine.record_feedback("BBa_R0010", true);
    }
    let response = engine.search(ctx("", filters, 2)).unwrap();
    assert_eq!(response.hits[0].id, "BBa_R0010");
}

#[test]
fn expired_deadline_surfaces_a_timeout() {
    let engine = engine();
    engine.ingest(catalog());

    let ctx = QueryContext::new("promoter", PartFilters::default(), 3, Duration::ZERO);
    match engine.search(ctx) {
        Err(EngineError::Timeout { .. }) => {}
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[test]
fn stale_snapshot_is_flagged_not_failed() {
    let engine = SearchEngine::new(EngineConfig {
        dimension: 128,
        pool_workers: 2,
        freshness_bound: Duration::ZERO,
        ..EngineConfig::default()
    });
    engine.ingest(catalog());

    let response = engine
        .search(ctx("promoter", PartFilters::default(), 3))
        .unwrap();
    assert!(response.stale);
    assert!(!response.hits.is_empty());
}

#[test]
fn reingesting_changed_text_reorders_results() {
    let engine = engine();
    engine.ingest(catalog());

    // Repoint the RBS record at fluorescent reporter vocabulary.
    engine.ingest(vec![part(
        "BBa_B0034",
        "green fluorescent reporter gfp emission measurement",
        &["RBS"],
    )]);

    let response = engine
        .search(ctx("gfp fluorescent reporter", PartFilters::default(), 2))
        .unwrap();
    let ids: Vec<&str> = response.hits.iter().map(|h| h.id.as_str()).collect();
    assert!(ids.contains(&"BBa_B0034"));

    // Still exactly one row per id in the index.
    assert_eq!(engine.stats().index.count, 5);
}
