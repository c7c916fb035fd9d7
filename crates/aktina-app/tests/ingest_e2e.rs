use std::path::PathBuf;
use std::sync::Arc;

use aktina_app::engine::SearchEngine;
use aktina_app::pipeline::{IngestError, IngestEvent, IngestionPipeline};
use aktina_app::progress::TrickleConfig;
use aktina_app::testing::{MemoryEngine, MockArchive};
use futures_util::{pin_mut, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

const INDEX: &str = "studies";

fn pipeline(archive: Arc<MockArchive>, engine: Arc<MemoryEngine>) -> IngestionPipeline {
    IngestionPipeline::new(
        archive,
        engine as Arc<dyn SearchEngine>,
        INDEX,
        TrickleConfig::default(),
    )
}

async fn drive<S>(events: S) -> Vec<Result<IngestEvent, IngestError>>
where
    S: Stream<Item = Result<IngestEvent, IngestError>>,
{
    pin_mut!(events);
    let mut collected = Vec::new();
    while let Some(event) = events.next().await {
        collected.push(event);
    }
    collected
}

fn fractions(events: &[Result<IngestEvent, IngestError>]) -> Vec<f64> {
    events
        .iter()
        .filter_map(|event| match event {
            Ok(IngestEvent::Progress { fraction, .. }) => Some(*fraction),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn two_files_one_study_end_to_end() {
    let archive = Arc::new(MockArchive::with_study("S1", &[("SE1", 2)]));
    let engine = Arc::new(MemoryEngine::new());
    let pipeline = pipeline(archive, Arc::clone(&engine));

    let events = drive(pipeline.run(
        vec![PathBuf::from("a.dcm"), PathBuf::from("b.dcm")],
        CancellationToken::new(),
    ))
    .await;

    let fractions = fractions(&events);
    assert!(
        fractions.windows(2).all(|pair| pair[0] < pair[1]),
        "progress must be strictly increasing: {fractions:?}"
    );
    assert_eq!(*fractions.last().expect("progress emitted"), 1.0);
    assert!(matches!(
        events.last(),
        Some(Ok(IngestEvent::Done { study_uids })) if study_uids == &["S1".to_string()]
    ));

    assert_eq!(engine.document_count(INDEX), 1);
    let document = engine.document(INDEX, "S1").expect("study indexed");
    assert_eq!(document["uid"], "S1");
    assert_eq!(document["metadata"]["0020000D"]["Value"][0], "S1");
    let series = document["series"].as_array().expect("series array");
    assert_eq!(series.len(), 1);
    assert_eq!(series[0]["uid"], "SE1");
    let instances = series[0]["instances"].as_array().expect("instances array");
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[0]["metadata"]["00080018"]["Value"][0], "SE1/I1");
    assert!(instances[0]["descriptor"].is_object());
}

#[tokio::test]
async fn a_failure_in_the_third_study_keeps_the_first_two() {
    let archive = Arc::new(MockArchive::with_study("S1", &[("SE1", 1)]));
    archive.add_study("S2", &[("SE2", 1)]);
    archive.add_study("S3", &[("SE3", 1)]);
    archive.fail_study("S3");
    let engine = Arc::new(MemoryEngine::new());
    let pipeline = pipeline(archive, Arc::clone(&engine));

    let events = drive(pipeline.run(vec![PathBuf::from("a.dcm")], CancellationToken::new())).await;

    match events.last().expect("events emitted") {
        Err(IngestError::Retrieval(err)) => assert_eq!(err.study_uid, "S3"),
        other => panic!("expected a retrieval failure, got {other:?}"),
    }
    assert_eq!(engine.document_count(INDEX), 2);
    assert!(engine.document(INDEX, "S1").is_some());
    assert!(engine.document(INDEX, "S2").is_some());
    assert!(engine.document(INDEX, "S3").is_none());
}

#[tokio::test]
async fn an_index_write_failure_names_the_study() {
    let archive = Arc::new(MockArchive::with_study("S1", &[("SE1", 1)]));
    let engine = Arc::new(MemoryEngine::new());
    engine.fail_upsert("S1");
    let pipeline = pipeline(archive, Arc::clone(&engine));

    let events = drive(pipeline.run(vec![PathBuf::from("a.dcm")], CancellationToken::new())).await;

    match events.last().expect("events emitted") {
        Err(IngestError::Indexing { study_uid, .. }) => assert_eq!(study_uid, "S1"),
        other => panic!("expected an indexing failure, got {other:?}"),
    }
    assert_eq!(engine.document_count(INDEX), 0);
}

#[tokio::test]
async fn repeated_ingestion_is_idempotent() {
    let archive = Arc::new(MockArchive::with_study("S1", &[("SE1", 2)]));
    let engine = Arc::new(MemoryEngine::new());
    let pipeline = pipeline(archive, Arc::clone(&engine));

    for _ in 0..3 {
        let events =
            drive(pipeline.run(vec![PathBuf::from("a.dcm")], CancellationToken::new())).await;
        assert!(matches!(events.last(), Some(Ok(IngestEvent::Done { .. }))));
    }
    assert_eq!(engine.document_count(INDEX), 1);
}
