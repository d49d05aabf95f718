//! Full ingestion runs against the in-memory store.

use std::sync::Arc;

use atlas_core::{fields, FieldMap, RawEntry, Table, Value};
use atlas_storage::{MemoryStore, RecordStore};
use atlas_sync::{Aggregator, EngineConfig, RunOptions, RunStart, OG_TAGS};

const FEED: &str = r#"[
    {"url": "http://Example.com/foo", "tags": ["x"]},
    "https://unrelated.example.com",
    {"url": "https://example.com/foo/", "tags": ["y"], "rating": 2}
]"#;

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            Table::Sources.id(),
            FieldMap::from([
                (fields::SOURCE_NAME.to_owned(), Value::from("Example")),
                (fields::LABEL.to_owned(), Value::from("Example Source")),
            ]),
        )
        .await;
    store
}

async fn run_feed(store: &Arc<MemoryStore>) -> atlas_sync::RunSummary {
    let entries: Vec<RawEntry> = serde_json::from_str(FEED).expect("feed should parse");
    let mut run = match Aggregator::start(
        store.clone(),
        EngineConfig::default(),
        RunOptions::new("Example"),
        None,
    )
    .await
    .expect("run should start")
    {
        RunStart::Ready(run) => run,
        RunStart::NoChange { .. } => panic!("no timestamp was given, the run must proceed"),
    };
    for entry in entries {
        run.add_entry(entry).await.expect("entry should ingest");
    }
    run.finish().await.expect("run should settle")
}

#[tokio::test]
async fn spellings_of_one_site_collapse_into_one_row() {
    let store = seeded_store().await;
    let summary = run_feed(&store).await;

    assert_eq!(summary.entries_ingested, 3);
    assert_eq!(summary.sites.written, 2);
    assert_eq!(summary.sites.unchanged, 0);

    let rows = store.list_records(Table::Sites.id()).await.unwrap();
    assert_eq!(rows.len(), 2);
    let site = rows
        .iter()
        .find(|row| {
            row.fields.get(fields::NORMALIZED_URL).and_then(Value::as_str)
                == Some("https://example.com/foo")
        })
        .expect("the two spellings must share one row");
    assert_eq!(site.fields[fields::URL], Value::from("https://example.com/foo/"));
    assert_eq!(site.fields["Example_rating"], Value::Float(2.0));

    let tag_rows = store.list_records("Example_tags").await.unwrap();
    let tag_id = |literal: &str| {
        tag_rows
            .iter()
            .find(|row| row.fields[fields::TAG] == Value::from(literal))
            .map(|row| row.id)
            .unwrap_or_else(|| panic!("no side-table row for {literal}"))
    };
    assert_eq!(
        site.fields["Example_tags"],
        Value::Refs(vec![tag_id("x"), tag_id("y")])
    );

    let display = summary
        .site_rows
        .iter()
        .find(|row| row.get(fields::URL) == Some(&Value::from("https://example.com/foo/")))
        .expect("written sites appear in the display rows");
    assert_eq!(
        display[OG_TAGS],
        Value::List(vec!["x".to_owned(), "y".to_owned()])
    );
}

#[tokio::test]
async fn an_identical_second_run_settles_without_writes() {
    let store = seeded_store().await;
    run_feed(&store).await;
    let rerun = run_feed(&store).await;

    assert_eq!(rerun.sites.written, 0);
    assert_eq!(rerun.sites.unchanged, 2);
    assert!(rerun.site_rows.is_empty());
    assert_eq!(store.list_records(Table::Sites.id()).await.unwrap().len(), 2);
    assert_eq!(store.list_records("Example_tags").await.unwrap().len(), 2);
}
