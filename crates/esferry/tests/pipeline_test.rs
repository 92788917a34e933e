//! End-to-end copies through the scroll pipeline and bulk worker pool.
//!
//! Clusters are held in memory, so these run without a server.

#![allow(clippy::pedantic)]

use std::sync::Arc;

use esferry::config::{
    BulkOptions, FieldRename, InputFileConfig, InputFormat, MigrationConfig, OutputFileConfig,
    TransformOptions,
};
use esferry::connectors::memory::MemoryCluster;
use esferry::connectors::{BulkSink, ScrollRequest, ScrollSource};
use esferry::document::payload;
use esferry::migrator::{Migrator, RunReport};
use esferry::pipeline::{Output, Pipeline};
use esferry::transform::Transformer;
use serde_json::json;

fn seeded_cluster(index: &str, n: usize) -> Arc<MemoryCluster> {
    let cluster = Arc::new(MemoryCluster::new());
    for i in 0..n {
        cluster.insert(
            index,
            &format!("doc-{:04}", i),
            payload(json!({"n": i, "name": format!("user {}", i), "tmp": true})),
        );
    }
    cluster
}

fn bulk_options(workers: usize) -> BulkOptions {
    BulkOptions {
        workers,
        bulk_size_mb: 1,
        queue_capacity: 64,
        ..BulkOptions::default()
    }
}

fn pipeline_between(
    source: &Arc<MemoryCluster>,
    dest: &Arc<MemoryCluster>,
    request: ScrollRequest,
    workers: usize,
    transform: &TransformOptions,
    target_index: Option<&str>,
) -> Pipeline {
    let reader: Arc<dyn ScrollSource> = source.clone();
    let sink: Arc<dyn BulkSink> = dest.clone();
    Pipeline::new(
        reader,
        Output::Bulk(sink),
        request,
        bulk_options(workers),
        Transformer::new(transform, target_index, false),
    )
}

#[tokio::test]
async fn test_sliced_copy_moves_every_document() {
    let source = seeded_cluster("logs", 250);
    let dest = Arc::new(MemoryCluster::new());

    let stats = pipeline_between(
        &source,
        &dest,
        ScrollRequest::new("logs", 17),
        3,
        &TransformOptions::default(),
        Some("logs-copy"),
    )
    .with_slices(4)
    .run()
    .await
    .unwrap();

    assert_eq!(stats.scrolled, 250);
    assert_eq!(stats.written, 250);
    assert_eq!(stats.failed_batches, 0);
    assert_eq!(stats.rounds, 1);
    assert_eq!(dest.payloads("logs-copy"), source.payloads("logs"));
    assert_eq!(source.open_cursors(), 0);
}

#[tokio::test]
async fn test_copy_keeps_source_index_names_without_target() {
    let source = Arc::new(MemoryCluster::new());
    source.insert("logs-a", "1", payload(json!({"v": 1})));
    source.insert("logs-b", "2", payload(json!({"v": 2})));
    source.insert("metrics", "3", payload(json!({"v": 3})));
    let dest = Arc::new(MemoryCluster::new());

    let stats = pipeline_between(
        &source,
        &dest,
        ScrollRequest::new("logs-*", 10),
        2,
        &TransformOptions::default(),
        None,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(stats.written, 2);
    assert_eq!(dest.count("logs-a"), 1);
    assert_eq!(dest.count("logs-b"), 1);
    assert!(!dest.has_index("metrics"));
}

#[tokio::test]
async fn test_transform_renames_and_skips_fields() {
    let source = seeded_cluster("users", 20);
    let dest = Arc::new(MemoryCluster::new());
    let transform = TransformOptions {
        rename_fields: vec![FieldRename {
            from: "name".to_string(),
            to: "full_name".to_string(),
        }],
        skip_fields: vec!["tmp".to_string()],
        ..TransformOptions::default()
    };

    pipeline_between(
        &source,
        &dest,
        ScrollRequest::new("users", 5),
        2,
        &transform,
        Some("people"),
    )
    .run()
    .await
    .unwrap();

    let copied = dest.payloads("people");
    assert_eq!(copied.len(), 20);
    let doc = &copied["doc-0007"];
    assert_eq!(doc.get("full_name"), Some(&json!("user 7")));
    assert_eq!(doc.get("n"), Some(&json!(7)));
    assert!(doc.get("name").is_none());
    assert!(doc.get("tmp").is_none());
}

#[tokio::test]
async fn test_repeat_with_regenerated_ids_multiplies_documents() {
    let source = seeded_cluster("logs", 30);
    let dest = Arc::new(MemoryCluster::new());
    let transform = TransformOptions {
        regenerate_id: true,
        repeat_times: 3,
        ..TransformOptions::default()
    };

    let stats = pipeline_between(
        &source,
        &dest,
        ScrollRequest::new("logs", 8),
        2,
        &transform,
        Some("load"),
    )
    .with_slices(2)
    .with_repeat(3)
    .run()
    .await
    .unwrap();

    assert_eq!(stats.rounds, 3);
    assert_eq!(stats.scrolled, 90);
    assert_eq!(dest.count("load"), 90);
}

#[tokio::test]
async fn test_repeat_without_regenerated_ids_overwrites() {
    let source = seeded_cluster("logs", 12);
    let dest = Arc::new(MemoryCluster::new());

    let stats = pipeline_between(
        &source,
        &dest,
        ScrollRequest::new("logs", 5),
        1,
        &TransformOptions::default(),
        Some("load"),
    )
    .with_repeat(2)
    .run()
    .await
    .unwrap();

    assert_eq!(stats.written, 24);
    assert_eq!(dest.count("load"), 12);
}

#[tokio::test]
async fn test_failed_bulk_is_dropped_and_counted() {
    let source = seeded_cluster("logs", 10);
    let dest = Arc::new(MemoryCluster::new());
    dest.fail_next_bulks(1);

    let stats = pipeline_between(
        &source,
        &dest,
        ScrollRequest::new("logs", 100),
        1,
        &TransformOptions::default(),
        Some("copy"),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(stats.scrolled, 10);
    assert_eq!(stats.failed_batches, 1);
    assert_eq!(stats.written, 0);
    assert_eq!(dest.count("copy"), 0);
}

#[tokio::test]
async fn test_missing_source_index_ends_run_without_documents() {
    let source = seeded_cluster("logs", 3);
    let dest = Arc::new(MemoryCluster::new());

    let stats = pipeline_between(
        &source,
        &dest,
        ScrollRequest::new("absent", 10),
        2,
        &TransformOptions::default(),
        Some("copy"),
    )
    .with_slices(2)
    .run()
    .await
    .unwrap();

    assert_eq!(stats.scrolled, 0);
    assert_eq!(stats.written, 0);
    assert_eq!(dest.bulk_calls(), 0);
}

#[tokio::test]
async fn test_dump_then_reload_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("logs.json");
    let source = seeded_cluster("logs", 40);

    let reader: Arc<dyn ScrollSource> = source.clone();
    let dumped = Pipeline::new(
        reader,
        Output::File(OutputFileConfig {
            path: dump.clone(),
            truncate: true,
        }),
        ScrollRequest::new("logs", 9),
        bulk_options(1),
        Transformer::default(),
    )
    .with_slices(3)
    .run()
    .await
    .unwrap();
    assert_eq!(dumped.written, 40);

    let reloaded = dir.path().join("reloaded.json");
    let config = MigrationConfig {
        input_file: Some(InputFileConfig {
            path: dump,
            format: InputFormat::Dump,
        }),
        output_file: Some(OutputFileConfig {
            path: reloaded.clone(),
            truncate: true,
        }),
        ..MigrationConfig::default()
    };
    let report = Migrator::new(config).unwrap().run().await.unwrap();

    let RunReport::Migration(stats) = report else {
        panic!("expected a migration report");
    };
    assert_eq!(stats.scrolled, 40);
    assert_eq!(stats.written, 40);

    let lines = std::fs::read_to_string(reloaded).unwrap();
    let mut ids: Vec<String> = lines
        .lines()
        .map(|line| {
            let hit: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(hit["_index"], "logs");
            hit["_id"].as_str().unwrap().to_string()
        })
        .collect();
    ids.sort();
    let expected: Vec<String> = source.payloads("logs").into_keys().collect();
    assert_eq!(ids, expected);
}
