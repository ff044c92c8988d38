//! End-to-end sink scenarios against the in-memory transactional broker.

use bytes::Bytes;
use partitioned_log::test_utils::{InMemorySinkBroker, InMemoryTransactionalWriter};
use partitioned_log::{
    DeliveryMode, ExactlyOnceSink, LogPosition, Partition, SinkError, SinkOptions, SinkRecord,
};

fn record(key: &str, payload: &str) -> SinkRecord {
    SinkRecord::new(
        "out",
        Some(Bytes::copy_from_slice(key.as_bytes())),
        Bytes::copy_from_slice(payload.as_bytes()),
        None,
    )
}

fn sink(
    broker: &InMemorySinkBroker,
    shards: usize,
    mode: DeliveryMode,
) -> ExactlyOnceSink<InMemoryTransactionalWriter> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let writers = (0..shards).map(|i| broker.writer(i)).collect();
    ExactlyOnceSink::new(SinkOptions::new("group", shards).with_mode(mode), writers).unwrap()
}

fn payloads(broker: &InMemorySinkBroker) -> Vec<String> {
    let mut out: Vec<String> = broker
        .visible_payloads()
        .iter()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect();
    out.sort();
    out
}

#[tokio::test]
async fn commit_publishes_records_and_offsets_atomically() {
    let broker = InMemorySinkBroker::default();
    let mut sink = sink(&broker, 2, DeliveryMode::ExactlyOnce);

    for i in 0..10 {
        sink.write(record(&format!("k{i}"), &format!("v{i}"))).await.unwrap();
    }
    assert!(broker.visible().is_empty(), "records leaked before commit");

    let upstream = Partition::new("in", 0);
    sink.finalize_bundle(&[LogPosition::new(upstream.clone(), 42)])
        .await
        .unwrap();

    assert_eq!(broker.visible().len(), 10);
    assert_eq!(broker.committed_offset("group", &upstream), Some(42));
    sink.close().await;
}

#[tokio::test]
async fn send_failure_aborts_the_bundle_and_replay_yields_no_duplicates() {
    let broker = InMemorySinkBroker::default();
    let mut sink = sink(&broker, 1, DeliveryMode::ExactlyOnce);
    broker.fail_next_sends(1);

    for i in 0..3 {
        sink.write(record("k", &format!("v{i}"))).await.unwrap();
    }
    let err = sink.finalize_bundle(&[]).await.unwrap_err();
    assert!(matches!(err, SinkError::Send { .. }));
    assert!(broker.visible().is_empty(), "aborted bundle leaked records");

    // Redrive the whole bundle, as the surrounding runner would.
    for i in 0..3 {
        sink.write(record("k", &format!("v{i}"))).await.unwrap();
    }
    sink.finalize_bundle(&[]).await.unwrap();

    assert_eq!(payloads(&broker), vec!["v0", "v1", "v2"]);
    sink.close().await;
}

#[tokio::test]
async fn commit_conflict_surfaces_and_replay_starts_clean() {
    let broker = InMemorySinkBroker::default();
    let mut sink = sink(&broker, 1, DeliveryMode::ExactlyOnce);
    broker.fail_next_commits(1);

    sink.write(record("k", "first")).await.unwrap();
    sink.write(record("k", "second")).await.unwrap();
    let err = sink.finalize_bundle(&[]).await.unwrap_err();
    assert!(matches!(err, SinkError::CommitConflict { .. }));
    assert!(broker.visible().is_empty());

    sink.write(record("k", "first")).await.unwrap();
    sink.write(record("k", "second")).await.unwrap();
    sink.finalize_bundle(&[]).await.unwrap();

    assert_eq!(payloads(&broker), vec!["first", "second"]);
    sink.close().await;
}

#[tokio::test]
async fn empty_bundle_still_advances_consumer_offsets() {
    let broker = InMemorySinkBroker::default();
    let mut sink = sink(&broker, 2, DeliveryMode::ExactlyOnce);

    let upstream = Partition::new("in", 3);
    sink.finalize_bundle(&[LogPosition::new(upstream.clone(), 7)])
        .await
        .unwrap();

    assert!(broker.visible().is_empty());
    assert_eq!(broker.committed_offset("group", &upstream), Some(7));
    sink.close().await;
}

#[tokio::test]
async fn failure_on_one_shard_aborts_every_shard() {
    let broker = InMemorySinkBroker::default();
    let mut sink = sink(&broker, 3, DeliveryMode::ExactlyOnce);
    broker.fail_next_commits(1);

    // Keyless records spread across all three shards.
    for i in 0..6 {
        sink.write(SinkRecord::new(
            "out",
            None,
            Bytes::copy_from_slice(format!("v{i}").as_bytes()),
            None,
        ))
        .await
        .unwrap();
    }
    assert!(sink.finalize_bundle(&[]).await.is_err());

    // No shard's records may survive a partially failed bundle.
    assert!(broker.visible().is_empty(), "partial bundle became visible");
    sink.close().await;
}

#[tokio::test]
async fn at_least_once_surfaces_async_send_errors_on_finalize() {
    let broker = InMemorySinkBroker::default();
    let mut sink = sink(&broker, 1, DeliveryMode::AtLeastOnce);
    broker.fail_next_sends(1);

    sink.write(record("k", "lost")).await.unwrap();
    let err = sink.finalize_bundle(&[]).await.unwrap_err();
    assert!(matches!(err, SinkError::Send { .. }));

    sink.write(record("k", "kept")).await.unwrap();
    sink.finalize_bundle(&[]).await.unwrap();
    assert_eq!(payloads(&broker), vec!["kept"]);
    sink.close().await;
}

#[tokio::test]
async fn at_least_once_records_need_no_finalize_to_become_visible() {
    let broker = InMemorySinkBroker::default();
    let mut sink = sink(&broker, 1, DeliveryMode::AtLeastOnce);

    sink.write(record("k", "v")).await.unwrap();
    sink.finalize_bundle(&[]).await.unwrap();
    assert_eq!(broker.visible().len(), 1);

    // Even without finalize, a further record is already visible: the broker
    // append happens on send in this mode.
    sink.write(record("k", "w")).await.unwrap();
    sink.finalize_bundle(&[]).await.unwrap();
    assert_eq!(broker.visible().len(), 2);
    sink.close().await;
}
