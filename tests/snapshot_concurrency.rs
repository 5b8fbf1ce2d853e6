//! Concurrent queries against an index that is being rebuilt.
//!
//! Readers must always observe a complete snapshot: every result references
//! an id that exists, and a snapshot held across a rebuild keeps serving its
//! own generation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use partseek::config::EngineConfig;
use partseek::engine::SearchEngine;
use partseek::model::{PartFilters, PartRecord, QueryContext};

fn part(id: &str, text: &str) -> PartRecord {
    PartRecord {
        id: id.into(),
        label: id.into(),
        text: text.into(),
        sequence: String::new(),
        type_hierarchy: vec!["Promoter".into()],
        metadata: BTreeMap::new(),
    }
}

#[test]
fn queries_see_complete_snapshots_during_rebuilds() {
    let engine = Arc::new(SearchEngine::new(EngineConfig {
        dimension: 64,
        pool_workers: 4,
        ..EngineConfig::default()
    }));

    let initial: Vec<PartRecord> = (0..50)
        .map(|i| part(&format!("seed-{i:03}"), &format!("constitutive promoter variant {i}")))
        .collect();
    engine.ingest(initial);

    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let engine = engine.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let mut round = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let batch: Vec<PartRecord> = (0..10)
                    .map(|i| {
                        part(
                            &format!("batch{round}-{i:02}"),
                            &format!("inducible promoter round {round} item {i}"),
                        )
                    })
                    .collect();
                engine.ingest(batch);
                round += 1;
            }
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let engine = engine.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let ctx = QueryContext::new(
                        "promoter variant",
                        PartFilters::default(),
                        5,
                        Duration::from_secs(5),
                    );
                    let response = engine.search(ctx).expect("search during rebuild");
                    for hit in &response.hits {
                        // Every id a query returns must resolve to a record.
                        assert!(
                            engine.record(&hit.id).is_some(),
                            "hit {} has no backing record",
                            hit.id
                        );
                    }
                }
            })
        })
        .collect();

    std::thread::sleep(Duration::from_millis(300));
    stop.store(true, Ordering::Relaxed);

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    // Index count equals distinct record count after all the churn.
    let stats = engine.stats();
    assert_eq!(stats.index.count, engine.record_count());
}
