//! Incremental document summaries persisted in SQLite
//!
//! Each batch is stored and fingerprinted before the next one starts, so a
//! failed or crashed run only costs the batch that was in flight.

mod common;

use std::sync::Arc;

use common::Node;
use freshet_core::application::{
    shutdown_channel, DocumentBatcher, StartupRecovery, TickMode, Ttl, TtlTable,
};
use freshet_core::domain::{DataDomain, JobStatus, TemplateVersion};
use freshet_core::port::document_pipeline::mocks::{InMemoryDocuments, RecordingSummarizer};
use freshet_core::port::{EntityRegistry, FetcherRegistry, FingerprintStore, JobStore};

fn batcher(
    node: &Node,
    source: Arc<InMemoryDocuments>,
    summarizer: Arc<RecordingSummarizer>,
    template_version: TemplateVersion,
) -> Arc<DocumentBatcher> {
    Arc::new(DocumentBatcher::new(
        source,
        summarizer,
        node.documents.clone(),
        node.documents.clone(),
        node.runner.clone(),
        2,
        template_version,
    ))
}

fn summaries_ttl() -> TtlTable {
    TtlTable::new([(DataDomain::DocumentSummaries, Ttl::Permanent)])
}

#[tokio::test]
async fn test_failed_batch_keeps_earlier_batches_and_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("freshet.db");
    let source = Arc::new(InMemoryDocuments::new().with_documents("AAPL", 5));
    let (_tx, token) = shutdown_channel();

    {
        let node = Node::open(&db).await;
        let summarizer = Arc::new(RecordingSummarizer::new());
        summarizer.fail_on_batch(3);

        let result = batcher(&node, source.clone(), summarizer.clone(), 1)
            .process_entity("AAPL", &token)
            .await;

        assert!(result.is_err());
        assert_eq!(summarizer.batch_sizes(), vec![2, 2, 1]);
        assert_eq!(node.documents.load_summaries("AAPL").await.unwrap().len(), 4);
        node.close().await;
    }

    let node = Node::open(&db).await;
    let processed = node.documents.processed_fingerprints("AAPL", 1).await.unwrap();
    assert_eq!(processed.len(), 4);
    assert!(!processed.contains("hash-5"));

    let summarizer = Arc::new(RecordingSummarizer::new());
    let report = batcher(&node, source, summarizer.clone(), 1)
        .process_entity("AAPL", &token)
        .await
        .unwrap();

    assert_eq!(report.batch_sizes, vec![1]);
    assert_eq!(report.processed, 1);
    assert_eq!(report.skipped, 4);
    assert_eq!(summarizer.summarized_hashes(), vec!["hash-5".to_string()]);

    let stored = node.documents.load_summaries("AAPL").await.unwrap();
    let hashes: Vec<_> = stored.iter().map(|s| s.content_hash.as_str()).collect();
    assert_eq!(hashes, vec!["hash-1", "hash-2", "hash-3", "hash-4", "hash-5"]);
}

#[tokio::test]
async fn test_template_bump_reprocesses_everything() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("freshet.db");
    let source = Arc::new(InMemoryDocuments::new().with_documents("AAPL", 5));
    let (_tx, token) = shutdown_channel();

    // Version 1 summarizes all five documents through the scheduler
    {
        let node = Node::open(&db).await;
        node.track(&["AAPL"]).await;
        let summarizer = Arc::new(RecordingSummarizer::new());
        let scheduler = node.scheduler(
            summaries_ttl(),
            FetcherRegistry::new().register(
                DataDomain::DocumentSummaries,
                batcher(&node, source.clone(), summarizer.clone(), 1),
            ),
            "v1",
        );

        let report = scheduler.tick(TickMode::Startup, &token).await.unwrap();
        assert_eq!(report.jobs_dispatched, 1);
        report.finalizer.await.unwrap();

        assert_eq!(summarizer.batch_sizes(), vec![2, 2, 1]);
        assert_eq!(
            node.registry
                .get_staleness("AAPL", DataDomain::DocumentSummaries)
                .await
                .unwrap(),
            Some(common::START_MS)
        );

        // Permanent TTL: a second tick does nothing
        let report = scheduler.tick(TickMode::Regular, &token).await.unwrap();
        assert_eq!(report.jobs_dispatched, 0);
        report.finalizer.await.unwrap();
        node.close().await;
    }

    // Restart on version 2
    let node = Node::open(&db).await;
    let report = StartupRecovery::new(
        node.store.clone(),
        node.registry.clone(),
        node.documents.clone(),
        2,
    )
    .recover()
    .await
    .unwrap();
    assert_eq!(report.summaries_rearmed, 1);
    assert_eq!(
        node.registry
            .get_staleness("AAPL", DataDomain::DocumentSummaries)
            .await
            .unwrap(),
        None
    );

    let summarizer = Arc::new(RecordingSummarizer::new());
    let scheduler = node.scheduler(
        summaries_ttl(),
        FetcherRegistry::new().register(
            DataDomain::DocumentSummaries,
            batcher(&node, source, summarizer.clone(), 2),
        ),
        "v2",
    );
    let report = scheduler.tick(TickMode::Startup, &token).await.unwrap();
    assert_eq!(report.jobs_dispatched, 1);
    let run = report.finalizer.await.unwrap().into_result().unwrap();

    assert_eq!(run.errors, 0);
    assert_eq!(summarizer.batch_sizes(), vec![2, 2, 1]);
    assert_eq!(node.documents.latest_template_version().await.unwrap(), Some(2));
    assert_eq!(node.documents.processed_fingerprints("AAPL", 2).await.unwrap().len(), 5);

    let stored = node.documents.load_summaries("AAPL").await.unwrap();
    assert_eq!(stored.len(), 5);
    assert!(stored.iter().all(|s| s.summary["template_version"] == 2));

    // A second recovery on the same version changes nothing
    let report = StartupRecovery::new(
        node.store.clone(),
        node.registry.clone(),
        node.documents.clone(),
        2,
    )
    .recover()
    .await
    .unwrap();
    assert_eq!(report.summaries_rearmed, 0);
}

#[tokio::test]
async fn test_summarizer_panic_fails_job_and_next_tick_resumes() {
    let node = Node::in_memory().await;
    node.track(&["AAPL"]).await;
    let source = Arc::new(InMemoryDocuments::new().with_documents("AAPL", 5));
    let summarizer = Arc::new(RecordingSummarizer::new());
    summarizer.panic_on_batch(2);

    let scheduler = node.scheduler(
        summaries_ttl(),
        FetcherRegistry::new().register(
            DataDomain::DocumentSummaries,
            batcher(&node, source.clone(), summarizer.clone(), 1),
        ),
        "run",
    );
    let (_tx, token) = shutdown_channel();

    let report = scheduler.tick(TickMode::Regular, &token).await.unwrap();
    let run = report.finalizer.await.unwrap().into_result().unwrap();

    assert_eq!(run.errors, 1);
    assert_eq!(node.runner.panics_caught(), 1);
    assert_eq!(node.store.count_by_status(JobStatus::Failed).await.unwrap(), 1);
    assert_eq!(node.gates.heavy().in_flight(), 0);
    assert_eq!(node.documents.load_summaries("AAPL").await.unwrap().len(), 2);

    node.clock.advance(60_000);
    let report = scheduler.tick(TickMode::Regular, &token).await.unwrap();
    assert_eq!(report.jobs_dispatched, 1);
    let run = report.finalizer.await.unwrap().into_result().unwrap();

    assert_eq!(run.errors, 0);
    // Calls 1 and 2 were the first run; 3 and 4 cover the remaining three
    assert_eq!(summarizer.batch_sizes(), vec![2, 2, 2, 1]);
    assert_eq!(node.documents.load_summaries("AAPL").await.unwrap().len(), 5);
    assert_eq!(
        node.registry
            .get_staleness("AAPL", DataDomain::DocumentSummaries)
            .await
            .unwrap(),
        Some(common::START_MS + 60_000)
    );
}
