//! Streaming session behaviour over the in-memory log

mod common;

use common::{seed_topic, streaming_config, CrashingHandler, RecordingHandler};
use pii_sampler::kafka::{
    FileOffsetStore, InMemoryOffsetStore, LogReader, LogTransport, MemoryTransport,
    OffsetStore, TopicPartition,
};
use pii_sampler::sampling::CancellationFlag;
use pii_sampler::streaming::{StreamingSession, TerminationReason};
use pii_sampler::SamplerError;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn topics() -> Vec<String> {
    vec!["events".to_string()]
}

#[tokio::test]
async fn test_restart_resumes_from_last_commit() {
    let dir = tempdir().unwrap();
    let offset_file = dir.path().join("offsets.json");
    let transport = Arc::new(MemoryTransport::new());
    seed_topic(&transport, "events", 1, 500);

    // first run dies after 250 records, between commits
    let crashing = Arc::new(CrashingHandler::new(250));
    let mut session = StreamingSession::new(
        transport.clone(),
        Arc::new(FileOffsetStore::new(&offset_file)),
        topics(),
        "streaming",
        streaming_config(100),
        crashing.clone(),
    );
    let crashed = crashing.crashed.clone();
    tokio::select! {
        _ = session.run(CancellationFlag::new()) => panic!("session should not finish"),
        _ = crashed.notified() => {}
    }
    drop(session);
    assert_eq!(crashing.last_offset(), Some(249));

    let stored = FileOffsetStore::new(&offset_file).load().await.unwrap();
    let committed = stored[&TopicPartition::new("events", 0)].offset;
    assert_eq!(committed, 200);

    // second run picks up at the durable offset
    let shutdown = CancellationFlag::new();
    let handler = Arc::new(RecordingHandler::new(shutdown.clone(), 300));
    let mut session = StreamingSession::new(
        transport.clone(),
        Arc::new(FileOffsetStore::new(&offset_file)),
        topics(),
        "streaming",
        streaming_config(100),
        handler.clone(),
    );
    let report = session.run(shutdown).await.unwrap();
    assert_eq!(report.termination, TerminationReason::Shutdown);

    let offsets = handler.offsets();
    assert_eq!(offsets.first(), Some(&200));
    assert_eq!(offsets.last(), Some(&499));
    let reprocessed = 250 - offsets[0];
    assert!(reprocessed >= 0 && reprocessed <= 100);

    let stored = FileOffsetStore::new(&offset_file).load().await.unwrap();
    assert_eq!(stored[&TopicPartition::new("events", 0)].offset, 500);
}

#[tokio::test]
async fn test_durable_offsets_win_over_group_offsets() {
    let transport = Arc::new(MemoryTransport::new());
    seed_topic(&transport, "events", 1, 50);

    // broker says 10, durable store says 30
    let mut reader = transport.open_reader("streaming").await.unwrap();
    reader
        .commit(&[(TopicPartition::new("events", 0), 10)])
        .await
        .unwrap();
    let store = Arc::new(InMemoryOffsetStore::with_offsets([(
        TopicPartition::new("events", 0),
        30,
    )]));

    let shutdown = CancellationFlag::new();
    let handler = Arc::new(RecordingHandler::new(shutdown.clone(), 20));
    let mut session = StreamingSession::new(
        transport.clone(),
        store.clone(),
        topics(),
        "streaming",
        streaming_config(100),
        handler.clone(),
    );
    session.run(shutdown).await.unwrap();

    assert_eq!(handler.offsets().first(), Some(&30));
    assert_eq!(store.get(&TopicPartition::new("events", 0)), Some(50));
}

#[tokio::test]
async fn test_offset_reset_applies_without_durable_offsets() {
    let transport = Arc::new(MemoryTransport::new());
    seed_topic(&transport, "events", 2, 10);

    let shutdown = CancellationFlag::new();
    let handler = Arc::new(RecordingHandler::new(shutdown.clone(), 20));
    let mut session = StreamingSession::new(
        transport.clone(),
        Arc::new(InMemoryOffsetStore::new()),
        topics(),
        "streaming",
        streaming_config(100),
        handler.clone(),
    );
    let report = session.run(shutdown).await.unwrap();

    assert_eq!(report.stats.processed, 20);
    let mut offsets = handler.offsets();
    offsets.sort();
    offsets.dedup();
    assert_eq!(offsets, (0..10).collect::<Vec<i64>>());
    assert_eq!(transport.committed("streaming", "events", 0), Some(10));
    assert_eq!(transport.committed("streaming", "events", 1), Some(10));
}

#[tokio::test]
async fn test_final_commit_on_shutdown() {
    let transport = Arc::new(MemoryTransport::new());
    seed_topic(&transport, "events", 1, 30);
    let store = Arc::new(InMemoryOffsetStore::new());

    let shutdown = CancellationFlag::new();
    let handler = Arc::new(RecordingHandler::new(shutdown.clone(), 30));
    let mut session = StreamingSession::new(
        transport.clone(),
        store.clone(),
        topics(),
        "streaming",
        streaming_config(1000),
        handler,
    );
    let report = session.run(shutdown).await.unwrap();

    assert_eq!(report.stats.commits, 1);
    assert_eq!(store.get(&TopicPartition::new("events", 0)), Some(30));
    assert_eq!(store.persist_count(), 1);
    assert_eq!(transport.committed("streaming", "events", 0), Some(30));
}

#[tokio::test]
async fn test_commits_every_interval() {
    let transport = Arc::new(MemoryTransport::new());
    seed_topic(&transport, "events", 1, 250);
    let store = Arc::new(InMemoryOffsetStore::new());

    let shutdown = CancellationFlag::new();
    let handler = Arc::new(RecordingHandler::new(shutdown.clone(), 250));
    let mut session = StreamingSession::new(
        transport.clone(),
        store.clone(),
        topics(),
        "streaming",
        streaming_config(100),
        handler,
    );
    let report = session.run(shutdown).await.unwrap();

    // two periodic commits plus the final one
    assert_eq!(report.stats.commits, 3);
    assert_eq!(store.persist_count(), 3);
    assert_eq!(store.get(&TopicPartition::new("events", 0)), Some(250));
}

#[tokio::test]
async fn test_handler_failures_do_not_stop_the_loop() {
    let transport = Arc::new(MemoryTransport::new());
    seed_topic(&transport, "events", 1, 20);

    let shutdown = CancellationFlag::new();
    let handler = Arc::new(RecordingHandler::new(shutdown.clone(), 20).failing_odd());
    let mut session = StreamingSession::new(
        transport.clone(),
        Arc::new(InMemoryOffsetStore::new()),
        topics(),
        "streaming",
        streaming_config(100),
        handler.clone(),
    );
    let report = session.run(shutdown).await.unwrap();

    assert_eq!(report.stats.processed, 20);
    assert_eq!(report.stats.handler_failures, 10);
    assert_eq!(report.stats.connection_failures, 0);
    assert_eq!(report.breaker.open_count, 0);
    assert_eq!(transport.committed("streaming", "events", 0), Some(20));
}

#[tokio::test]
async fn test_breaker_reconnects_after_poll_failures() {
    let transport = Arc::new(MemoryTransport::new());
    seed_topic(&transport, "events", 1, 50);
    // threshold 3: three failures open the circuit, two failed trials reopen it
    transport.fail_next_polls(5);

    let shutdown = CancellationFlag::new();
    let handler = Arc::new(RecordingHandler::new(shutdown.clone(), 50));
    let mut session = StreamingSession::new(
        transport.clone(),
        Arc::new(InMemoryOffsetStore::new()),
        topics(),
        "streaming",
        streaming_config(100),
        handler.clone(),
    );
    let report = session.run(shutdown).await.unwrap();

    assert_eq!(report.termination, TerminationReason::Shutdown);
    assert_eq!(report.stats.connection_failures, 5);
    assert_eq!(report.stats.circuit_opens, 3);
    assert_eq!(report.stats.reconnects, 3);
    assert_eq!(transport.readers_opened(), 4);
    assert!(session.breaker().state().is_closed());
    assert_eq!(session.breaker().consecutive_failures(), 0);
    assert_eq!(handler.count(), 50);
    assert_eq!(transport.committed("streaming", "events", 0), Some(50));
}

#[tokio::test]
async fn test_reconnect_does_not_replay_processed_records() {
    let transport = Arc::new(MemoryTransport::new().with_batch_size(10));
    seed_topic(&transport, "events", 1, 40);
    // two good polls, then enough failures to open the circuit once
    transport.fail_polls_after(2, 3);

    let shutdown = CancellationFlag::new();
    let handler = Arc::new(RecordingHandler::new(shutdown.clone(), 40));
    let mut session = StreamingSession::new(
        transport.clone(),
        Arc::new(InMemoryOffsetStore::new()),
        topics(),
        "streaming",
        streaming_config(100),
        handler.clone(),
    );
    let report = session.run(shutdown).await.unwrap();

    assert_eq!(report.stats.circuit_opens, 1);
    assert_eq!(handler.offsets(), (0..40).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_commit_failure_keeps_batch_records() {
    let transport = Arc::new(MemoryTransport::new());
    seed_topic(&transport, "events", 1, 25);
    transport.fail_next_commits(1);
    let store = Arc::new(InMemoryOffsetStore::new());

    let shutdown = CancellationFlag::new();
    let handler = Arc::new(RecordingHandler::new(shutdown.clone(), 25));
    let mut session = StreamingSession::new(
        transport.clone(),
        store.clone(),
        topics(),
        "streaming",
        streaming_config(10),
        handler.clone(),
    );
    let report = session.run(shutdown).await.unwrap();

    assert_eq!(report.stats.processed, 25);
    assert_eq!(report.stats.commit_failures, 1);
    assert_eq!(report.stats.connection_failures, 1);
    assert_eq!(store.get(&TopicPartition::new("events", 0)), Some(25));
}

#[tokio::test]
async fn test_circuit_open_terminates_when_configured() {
    let transport = Arc::new(MemoryTransport::new());
    seed_topic(&transport, "events", 1, 10);
    transport.fail_next_polls(100);

    let mut config = streaming_config(100);
    config.terminate_on_circuit_open = true;

    let mut session = StreamingSession::new(
        transport.clone(),
        Arc::new(InMemoryOffsetStore::new()),
        topics(),
        "streaming",
        config,
        Arc::new(RecordingHandler::new(CancellationFlag::new(), usize::MAX)),
    );
    let report = session.run(CancellationFlag::new()).await.unwrap();

    assert_eq!(report.termination, TerminationReason::CircuitOpen);
    assert_eq!(report.stats.connection_failures, 3);
    assert!(matches!(
        report.into_result(),
        Err(SamplerError::CircuitOpen {
            consecutive_failures: 3
        })
    ));
}

#[tokio::test]
async fn test_shutdown_interrupts_backoff() {
    let transport = Arc::new(MemoryTransport::new());
    seed_topic(&transport, "events", 1, 10);
    transport.fail_next_polls(1000);

    let mut config = streaming_config(100);
    config.failure_threshold = 1;
    config.backoff_base = Duration::from_secs(30);
    config.backoff_max = Duration::from_secs(30);

    let shutdown = CancellationFlag::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let mut session = StreamingSession::new(
        transport,
        Arc::new(InMemoryOffsetStore::new()),
        topics(),
        "streaming",
        config,
        Arc::new(RecordingHandler::new(CancellationFlag::new(), usize::MAX)),
    );
    let report = tokio::time::timeout(Duration::from_secs(5), session.run(shutdown))
        .await
        .expect("shutdown should interrupt the backoff")
        .unwrap();
    assert_eq!(report.termination, TerminationReason::Shutdown);
    assert_eq!(report.stats.circuit_opens, 1);
}
