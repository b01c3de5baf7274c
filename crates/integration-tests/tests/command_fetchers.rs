//! Command-backed fetchers driven by the scheduler over SQLite
#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Node;
use freshet_core::application::{shutdown_channel, DocumentBatcher, TickMode, Ttl, TtlTable};
use freshet_core::domain::{DataDomain, JobStatus};
use freshet_core::port::time_provider::SystemTimeProvider;
use freshet_core::port::{EntityRegistry, FetcherRegistry, JobStore};
use freshet_infra_system::{
    CommandDocumentSource, CommandFetcher, CommandRunner, CommandSpec, CommandSummarizer,
};

fn runner() -> Arc<CommandRunner> {
    Arc::new(CommandRunner::new(
        Arc::new(SystemTimeProvider),
        vec!["PATH".to_string()],
    ))
}

fn sh(script: &str, args: &[&str]) -> CommandSpec {
    let mut all = vec!["-c", script, "freshet"];
    all.extend_from_slice(args);
    CommandSpec::new("sh", all)
}

#[tokio::test]
async fn test_command_fetch_outcomes_are_recorded() {
    let node = Node::in_memory().await;
    node.track(&["AAPL", "MSFT"]).await;

    // AAPL succeeds; MSFT is rejected upstream
    let script = r#"
        if [ "$1" = "MSFT" ]; then echo "quota exceeded for $FRESHET_DOMAIN" >&2; exit 3; fi
        echo '{"updated": true}'
    "#;
    let fetcher = Arc::new(CommandFetcher::new(runner(), sh(script, &["{entity}"])));
    let scheduler = node.scheduler(
        TtlTable::new([(DataDomain::Price, Ttl::minutes(15))]),
        FetcherRegistry::new().register(DataDomain::Price, fetcher),
        "run",
    );
    let (_tx, token) = shutdown_channel();

    let report = scheduler.tick(TickMode::Regular, &token).await.unwrap();
    assert_eq!(report.jobs_dispatched, 2);
    let run = report.finalizer.await.unwrap().into_result().unwrap();
    assert_eq!(run.errors, 1);

    assert_eq!(node.store.count_by_status(JobStatus::Completed).await.unwrap(), 1);
    assert_eq!(node.store.count_by_status(JobStatus::Failed).await.unwrap(), 1);
    assert_eq!(
        node.registry.get_staleness("AAPL", DataDomain::Price).await.unwrap(),
        Some(common::START_MS)
    );
    assert_eq!(
        node.registry.get_staleness("MSFT", DataDomain::Price).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn test_command_timeout_fails_job() {
    let node = Node::in_memory().await;
    node.track(&["AAPL"]).await;

    let spec = sh("sleep 5", &[]).with_timeout(Duration::from_millis(100));
    let fetcher = Arc::new(CommandFetcher::new(runner(), spec));
    let scheduler = node.scheduler(
        TtlTable::new([(DataDomain::Fundamentals, Ttl::days(1))]),
        FetcherRegistry::new().register(DataDomain::Fundamentals, fetcher),
        "run",
    );
    let (_tx, token) = shutdown_channel();

    let report = scheduler.tick(TickMode::Regular, &token).await.unwrap();
    let run = report.finalizer.await.unwrap().into_result().unwrap();
    assert_eq!(run.errors, 1);

    let job = node
        .store
        .find_outstanding("AAPL", DataDomain::Fundamentals)
        .await
        .unwrap();
    assert!(job.is_none());
    assert_eq!(node.store.count_by_status(JobStatus::Failed).await.unwrap(), 1);
}

#[tokio::test]
async fn test_command_document_pipeline_end_to_end() {
    let node = Node::in_memory().await;
    node.track(&["AAPL"]).await;
    let (_tx, token) = shutdown_channel();
    let runner = runner();

    let list = sh(
        r#"test "$1" = AAPL || exit 1
        echo '[{"content_hash":"h1","title":"Q1","locator":"loc-1"},
               {"content_hash":"h2","title":"Q2","locator":"loc-2"},
               {"content_hash":"h3","title":"Q3","locator":"loc-3"}]'"#,
        &["{entity}"],
    );
    let load = sh(r#"echo "body of $1""#, &["{locator}"]);
    // One summary per content_hash found in the request on stdin
    let summarize = sh(
        r#"out=""
        for h in $(grep -o '"content_hash":"[^"]*"' | sed 's/"content_hash":"\(.*\)"/\1/'); do
            out="$out${out:+,}{\"content_hash\":\"$h\",\"summary\":{\"words\":3}}"
        done
        echo "[$out]""#,
        &[],
    );

    let batcher = Arc::new(DocumentBatcher::new(
        Arc::new(CommandDocumentSource::new(runner.clone(), list, load, token.clone())),
        Arc::new(CommandSummarizer::new(runner, summarize, token.clone())),
        node.documents.clone(),
        node.documents.clone(),
        node.runner.clone(),
        2,
        1,
    ));
    let scheduler = node.scheduler(
        TtlTable::new([(DataDomain::DocumentSummaries, Ttl::Permanent)]),
        FetcherRegistry::new().register(DataDomain::DocumentSummaries, batcher.clone()),
        "run",
    );

    let report = scheduler.tick(TickMode::Regular, &token).await.unwrap();
    let run = report.finalizer.await.unwrap().into_result().unwrap();
    assert_eq!(run.errors, 0);

    let stored = node.documents.load_summaries("AAPL").await.unwrap();
    let hashes: Vec<_> = stored.iter().map(|s| s.content_hash.as_str()).collect();
    assert_eq!(hashes, vec!["h1", "h2", "h3"]);
    assert!(stored.iter().all(|s| s.summary["words"] == 3));

    // Everything fingerprinted: a direct rerun has nothing left to do
    let report = batcher.process_entity("AAPL", &token).await.unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(report.skipped, 3);
}
