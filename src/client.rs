//! Broker contracts the engine is written against.
//!
//! The reader and sink never talk to a broker directly; they are handed
//! implementations of these traits at construction time. Production code uses
//! the rdkafka-backed implementations in [`crate::kafka`]; tests use the
//! in-memory doubles in [`crate::test_utils`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::{ClientError, SinkError};
use crate::types::{LogPosition, Partition, Record, SinkRecord};

/// Resolves once the broker has acknowledged (or rejected) a single send.
pub type DeliveryFuture = BoxFuture<'static, Result<(), String>>;

/// Read-side contract to the broker: manual partition assignment, seeking,
/// polling, offset lookup by timestamp, and partition bounds.
#[async_trait]
pub trait PartitionClient: Send + Sync + 'static {
    /// Replace the client's assignment with the given partitions.
    async fn assign(&self, partitions: &[Partition]) -> Result<(), ClientError>;

    /// Position the next poll for `partition` at `offset`.
    async fn seek(&self, partition: &Partition, offset: i64) -> Result<(), ClientError>;

    /// Fetch up to `max_records` already-appended records from the assigned
    /// partitions, waiting at most `timeout` for data to arrive.
    async fn poll(&self, max_records: usize, timeout: Duration)
        -> Result<Vec<Record>, ClientError>;

    /// For each partition in the map, the earliest offset whose record
    /// timestamp is at or after the requested timestamp, or `None` if no such
    /// record exists.
    async fn offsets_for_timestamps(
        &self,
        timestamps: &HashMap<Partition, DateTime<Utc>>,
    ) -> Result<HashMap<Partition, Option<i64>>, ClientError>;

    /// The first offset present in the partition.
    async fn beginning_offset(&self, partition: &Partition) -> Result<i64, ClientError>;

    /// One past the last offset present in the partition.
    async fn end_offset(&self, partition: &Partition) -> Result<i64, ClientError>;

    /// Commit offsets to the broker's consumer-group bookkeeping. Offsets
    /// follow the broker convention: the next offset to read.
    async fn commit_offsets(
        &self,
        group_id: &str,
        offsets: &[LogPosition],
    ) -> Result<(), ClientError>;
}

/// Write-side contract: a transactional producer owned by exactly one shard.
///
/// `send` queues the record and hands back a [`DeliveryFuture`]; the sink's
/// completion task resolves those asynchronously so submission is decoupled
/// from broker round-trip latency.
#[async_trait]
pub trait TransactionalWriter: Send + 'static {
    /// Open a transaction. `epoch` increases by one per transaction on a
    /// given shard and identifies the attempt in logs and bookkeeping.
    async fn begin_transaction(&mut self, epoch: u64) -> Result<(), SinkError>;

    /// Queue one record inside the current transaction (or directly, when no
    /// transaction is open).
    async fn send(&mut self, record: SinkRecord) -> Result<DeliveryFuture, SinkError>;

    /// Attach consumer-group offsets to the current transaction so they
    /// become visible atomically with the buffered records.
    async fn send_offsets(
        &mut self,
        group_id: &str,
        offsets: &[LogPosition],
    ) -> Result<(), SinkError>;

    /// Atomically make buffered records and attached offsets visible.
    async fn commit_transaction(&mut self) -> Result<(), SinkError>;

    /// Discard buffered records; attached offsets do not advance.
    async fn abort_transaction(&mut self) -> Result<(), SinkError>;

    /// Release broker resources. Idempotent.
    async fn close(&mut self);
}
