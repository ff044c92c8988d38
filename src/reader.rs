//! Partitioned reader: fair interleaving over many partition cursors with
//! checkpoint/restore and a merged event-time watermark.
//!
//! A background fetch task pulls batches from the broker client into bounded
//! per-partition queues; the foreground `advance()` only drains those queues
//! and never blocks on network I/O. Checkpointing reads cursor state owned
//! exclusively by the foreground, so it never pauses the fetcher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointMark, PartitionMark};
use crate::client::PartitionClient;
use crate::config::ReaderOptions;
use crate::cursor::{PartitionCursor, PartitionProgress};
use crate::error::{ClientError, ReadError};
use crate::metric_consts::{BACKLOG_BYTES, BACKLOG_RECORDS, BYTES_READ, RECORDS_READ};
use crate::timestamp::{WATERMARK_MAX, WATERMARK_UNKNOWN};
use crate::types::{Partition, Record, StartReadPolicy};

/// Creates one broker client per reader. Sub-readers produced by `split`
/// each build their own client from the same factory, so no two readers
/// share an assignment.
pub type ClientFactory<C> = Arc<dyn Fn() -> Result<C, ClientError> + Send + Sync>;

struct FetchHandle {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Unbounded reader over an explicit set of partitions.
pub struct PartitionedReader<C: PartitionClient> {
    factory: ClientFactory<C>,
    options: ReaderOptions,
    restore: Option<CheckpointMark>,
    client: Option<Arc<C>>,
    cursors: Vec<PartitionCursor>,
    /// Index of the cursor to try first on the next `advance()`.
    rr_next: usize,
    current: Option<(Record, DateTime<Utc>)>,
    fetch: Option<FetchHandle>,
    fetch_error: Arc<Mutex<Option<ReadError>>>,
    started: bool,
    closed: bool,
}

impl<C: PartitionClient> PartitionedReader<C> {
    /// A reader that starts from the configured [`StartReadPolicy`].
    pub fn new(factory: ClientFactory<C>, options: ReaderOptions) -> Self {
        Self {
            factory,
            options,
            restore: None,
            client: None,
            cursors: Vec::new(),
            rr_next: 0,
            current: None,
            fetch: None,
            fetch_error: Arc::new(Mutex::new(None)),
            started: false,
            closed: false,
        }
    }

    /// A reader that resumes from a checkpoint. The mark must cover every
    /// partition in the assignment; `start()` fails otherwise.
    pub fn from_checkpoint(
        factory: ClientFactory<C>,
        options: ReaderOptions,
        mark: CheckpointMark,
    ) -> Self {
        let mut reader = Self::new(factory, options);
        reader.restore = Some(mark);
        reader
    }

    pub fn options(&self) -> &ReaderOptions {
        &self.options
    }

    /// The broker client backing this reader, once started. Useful for
    /// finalizing checkpoint marks against the same consumer group.
    pub fn client(&self) -> Option<&Arc<C>> {
        self.client.as_ref()
    }

    /// Partition the assignment into `min(desired, partitions)` disjoint,
    /// covering subsets, one sub-reader per subset. Partitions are dealt
    /// round-robin so logical streams spread evenly. Must be called before
    /// `start()`; a started reader is returned unchanged.
    pub fn split(self, desired: usize) -> Vec<PartitionedReader<C>> {
        if self.started {
            warn!("split called on a started reader; returning it unsplit");
            return vec![self];
        }
        let count = desired.min(self.options.partitions.len()).max(1);
        if count <= 1 {
            return vec![self];
        }

        let mut groups: Vec<Vec<Partition>> = vec![Vec::new(); count];
        for (i, partition) in self.options.partitions.iter().enumerate() {
            groups[i % count].push(partition.clone());
        }

        groups
            .into_iter()
            .map(|subset| {
                let restore = self.restore.as_ref().map(|mark| {
                    CheckpointMark::new(
                        mark.partitions()
                            .iter()
                            .filter(|m| subset.contains(&m.partition()))
                            .cloned()
                            .collect(),
                    )
                });
                let mut options = self.options.clone();
                options.partitions = subset;
                let mut reader = PartitionedReader::new(self.factory.clone(), options);
                reader.restore = restore;
                reader
            })
            .collect()
    }

    /// Open all assigned cursors, seeking each to its checkpointed or
    /// policy-derived offset, and spawn the background fetcher. Blocks per
    /// partition up to `start_timeout`; a partition that cannot seek in time
    /// fails the whole start rather than being silently skipped.
    pub async fn start(&mut self) -> Result<(), ReadError> {
        if self.closed {
            return Err(ReadError::Closed);
        }
        if self.started {
            return Ok(());
        }
        if self.options.partitions.is_empty() {
            self.started = true;
            return Ok(());
        }
        // A failed start may have left partially-built cursors behind; a
        // retry rebuilds the full set from scratch.
        self.cursors.clear();
        self.rr_next = 0;
        self.current = None;

        let client = Arc::new((self.factory)()?);
        let starts = self.resolve_start_offsets(client.as_ref()).await?;
        client.assign(&self.options.partitions).await?;

        let mut queues = HashMap::with_capacity(starts.len());
        let mut progress = HashMap::with_capacity(starts.len());
        for (partition, offset, previous_watermark) in starts {
            self.seek_with_deadline(client.as_ref(), &partition, offset)
                .await?;

            let shared = Arc::new(PartitionProgress::new());
            match client.end_offset(&partition).await {
                Ok(end) => shared.set_end_offset(end),
                Err(e) => debug!(partition = %partition, error = %e, "initial end offset unavailable"),
            }

            let (tx, rx) = mpsc::channel(self.options.queue_capacity);
            let policy = self.options.timestamp_policy.create(previous_watermark);
            self.cursors.push(PartitionCursor::new(
                partition.clone(),
                offset,
                policy,
                shared.clone(),
                rx,
            ));
            queues.insert(partition.clone(), tx);
            progress.insert(partition, shared);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let fetcher = Fetcher {
            client: client.clone(),
            queues,
            progress,
            max_poll_records: self.options.max_poll_records,
            poll_timeout: self.options.poll_timeout,
            refresh_interval: self.options.end_offset_refresh_interval,
            error_slot: self.fetch_error.clone(),
        };
        let handle = tokio::spawn(fetcher.run(shutdown_rx));

        info!(
            group_id = self.options.group_id,
            partitions = self.cursors.len(),
            "partitioned reader started"
        );
        self.fetch = Some(FetchHandle {
            handle,
            shutdown: shutdown_tx,
        });
        self.client = Some(client);
        self.restore = None;
        self.started = true;
        Ok(())
    }

    /// Non-blocking: emit the first available buffered record, trying
    /// cursors just after the one that served last and wrapping once. Every
    /// partition gets a turn before any partition gets a second one, so no
    /// partition starves another under skewed load.
    pub fn advance(&mut self) -> Result<bool, ReadError> {
        if self.closed {
            return Err(ReadError::Closed);
        }
        if !self.started {
            return Err(ReadError::NotStarted);
        }
        if let Ok(mut slot) = self.fetch_error.lock() {
            if let Some(err) = slot.take() {
                // A permanent fetch failure poisons the reader.
                self.closed = true;
                return Err(err);
            }
        }

        let count = self.cursors.len();
        for i in 0..count {
            let idx = (self.rr_next + i) % count;
            if let Some((record, ts)) = self.cursors[idx].try_next() {
                let topic = record.partition().topic().to_string();
                let partition = record.partition().partition_number().to_string();
                counter!(RECORDS_READ, "topic" => topic.clone(), "partition" => partition.clone())
                    .increment(1);
                counter!(BYTES_READ, "topic" => topic, "partition" => partition)
                    .increment(record.size_bytes() as u64);
                self.rr_next = idx + 1;
                self.current = Some((record, ts));
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The last emitted record.
    pub fn current(&self) -> Option<&Record> {
        self.current.as_ref().map(|(record, _)| record)
    }

    /// The event timestamp stamped on the last emitted record.
    pub fn current_timestamp(&self) -> Option<DateTime<Utc>> {
        self.current.as_ref().map(|(_, ts)| *ts)
    }

    /// Merged watermark: the minimum over all partition watermarks. A
    /// partition with no record yet holds the merge at the unknown sentinel
    /// until its first record arrives.
    pub fn watermark(&mut self) -> DateTime<Utc> {
        if !self.started || self.closed {
            return WATERMARK_UNKNOWN;
        }
        let mut merged = WATERMARK_MAX;
        for cursor in &mut self.cursors {
            let topic = cursor.partition().topic().to_string();
            let number = cursor.partition().partition_number().to_string();
            if let Some(backlog) = cursor.backlog() {
                gauge!(BACKLOG_RECORDS, "topic" => topic.clone(), "partition" => number.clone())
                    .set(backlog as f64);
            }
            if let Some(bytes) = cursor.backlog_bytes() {
                gauge!(BACKLOG_BYTES, "topic" => topic, "partition" => number)
                    .set(bytes as f64);
            }
            let wm = cursor.watermark();
            if wm < merged {
                merged = wm;
            }
        }
        merged
    }

    /// Total known-unread records across the assignment.
    pub fn backlog(&self) -> i64 {
        self.cursors.iter().filter_map(|c| c.backlog()).sum()
    }

    /// Freeze current progress into an immutable mark. Reflects exactly what
    /// has been emitted so far, never fetched-but-unemitted records, and
    /// completes without blocking on the fetcher.
    pub fn checkpoint_mark(&self) -> Result<CheckpointMark, ReadError> {
        if self.closed {
            return Err(ReadError::Closed);
        }
        if !self.started {
            return Err(ReadError::NotStarted);
        }
        let partitions = self
            .cursors
            .iter()
            .map(|cursor| PartitionMark {
                topic: cursor.partition().topic().to_string(),
                partition: cursor.partition().partition_number(),
                offset: cursor.checkpoint_offset(),
                timestamp: cursor.last_delivered_timestamp(),
            })
            .collect();
        Ok(CheckpointMark::new(partitions))
    }

    /// Stop the fetcher and release the broker client. Idempotent;
    /// subsequent operations fail with `Closed`.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(fetch) = self.fetch.take() {
            let _ = fetch.shutdown.send(true);
            if let Err(e) = fetch.handle.await {
                warn!(error = %e, "fetch task did not shut down cleanly");
            }
        }
        self.cursors.clear();
        self.client = None;
        info!(group_id = self.options.group_id, "partitioned reader closed");
    }

    async fn resolve_start_offsets(
        &self,
        client: &C,
    ) -> Result<Vec<(Partition, i64, Option<DateTime<Utc>>)>, ReadError> {
        let partitions = &self.options.partitions;

        if let Some(mark) = &self.restore {
            let mut starts = Vec::with_capacity(partitions.len());
            for partition in partitions {
                let entry = mark.mark_for(partition).ok_or_else(|| {
                    ReadError::Decode(format!(
                        "checkpoint mark does not cover assigned partition {partition}"
                    ))
                })?;
                starts.push((partition.clone(), entry.offset + 1, entry.timestamp));
            }
            return Ok(starts);
        }

        match &self.options.start {
            StartReadPolicy::Earliest => {
                let mut starts = Vec::with_capacity(partitions.len());
                for partition in partitions {
                    let offset = client.beginning_offset(partition).await?;
                    starts.push((partition.clone(), offset, None));
                }
                Ok(starts)
            }
            StartReadPolicy::Latest => {
                let mut starts = Vec::with_capacity(partitions.len());
                for partition in partitions {
                    let offset = client.end_offset(partition).await?;
                    starts.push((partition.clone(), offset, None));
                }
                Ok(starts)
            }
            StartReadPolicy::Timestamp(ts) => {
                let requested: HashMap<Partition, DateTime<Utc>> =
                    partitions.iter().map(|p| (p.clone(), *ts)).collect();
                let resolved = client.offsets_for_timestamps(&requested).await?;
                let mut starts = Vec::with_capacity(partitions.len());
                for partition in partitions {
                    let offset = match resolved.get(partition) {
                        Some(Some(offset)) => *offset,
                        // No record at or after the requested time: start at
                        // the end and pick up whatever arrives next.
                        _ => client.end_offset(partition).await?,
                    };
                    starts.push((partition.clone(), offset, None));
                }
                Ok(starts)
            }
            StartReadPolicy::ExplicitOffsets(offsets) => {
                let mut starts = Vec::with_capacity(partitions.len());
                for partition in partitions {
                    let offset = offsets.get(partition).ok_or_else(|| {
                        ReadError::InvalidStartPosition(format!(
                            "no explicit start offset for assigned partition {partition}"
                        ))
                    })?;
                    starts.push((partition.clone(), *offset, None));
                }
                Ok(starts)
            }
        }
    }

    async fn seek_with_deadline(
        &self,
        client: &C,
        partition: &Partition,
        offset: i64,
    ) -> Result<(), ReadError> {
        let deadline = Instant::now() + self.options.start_timeout;
        let mut backoff = Duration::from_millis(50);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.init_timeout(partition));
            }
            match timeout(remaining, client.seek(partition, offset)).await {
                Ok(Ok(())) => {
                    debug!(partition = %partition, offset, "seek complete");
                    return Ok(());
                }
                Ok(Err(e)) if e.is_transient() => {
                    warn!(partition = %partition, error = %e, "transient error during seek, retrying");
                    sleep(backoff.min(deadline.saturating_duration_since(Instant::now()))).await;
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
                Ok(Err(e)) => return Err(ReadError::permanent(partition, e)),
                Err(_) => return Err(self.init_timeout(partition)),
            }
        }
    }

    fn init_timeout(&self, partition: &Partition) -> ReadError {
        ReadError::InitializationTimeout {
            partition: partition.clone(),
            timeout_ms: self.options.start_timeout.as_millis() as u64,
        }
    }
}

/// Background task: polls the broker client and routes records into the
/// per-partition queues. Transient errors back off and retry here; permanent
/// errors park in the shared slot and end the task, surfacing on the next
/// `advance()`.
struct Fetcher<C> {
    client: Arc<C>,
    queues: HashMap<Partition, mpsc::Sender<Record>>,
    progress: HashMap<Partition, Arc<PartitionProgress>>,
    max_poll_records: usize,
    poll_timeout: Duration,
    refresh_interval: Duration,
    error_slot: Arc<Mutex<Option<ReadError>>>,
}

impl<C: PartitionClient> Fetcher<C> {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let base_backoff = Duration::from_millis(100);
        let max_backoff = Duration::from_secs(5);
        let mut backoff = base_backoff;
        let mut last_refresh = Instant::now();

        loop {
            if *shutdown.borrow() {
                return;
            }

            if last_refresh.elapsed() >= self.refresh_interval {
                if !self.refresh_end_offsets().await {
                    return;
                }
                last_refresh = Instant::now();
            }

            match self.client.poll(self.max_poll_records, self.poll_timeout).await {
                Ok(records) => {
                    backoff = base_backoff;
                    for record in records {
                        let Some(queue) = self.queues.get(record.partition()) else {
                            continue;
                        };
                        // Bounded queue: waiting here throttles fetching when
                        // the foreground lags, instead of buffering without
                        // limit.
                        tokio::select! {
                            sent = queue.send(record) => {
                                if sent.is_err() {
                                    // Cursor dropped; the reader is closing.
                                    return;
                                }
                            }
                            _ = shutdown.changed() => return,
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "transient fetch error");
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = shutdown.changed() => return,
                    }
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(e) => {
                    error!(error = %e, "permanent fetch error, stopping fetcher");
                    self.park(e);
                    return;
                }
            }
        }
    }

    /// Returns false when a permanent error ended the task.
    async fn refresh_end_offsets(&self) -> bool {
        for (partition, progress) in &self.progress {
            match self.client.end_offset(partition).await {
                Ok(end) => progress.set_end_offset(end),
                Err(e) if e.is_transient() => {
                    debug!(partition = %partition, error = %e, "end offset refresh skipped");
                }
                Err(e) => {
                    error!(partition = %partition, error = %e, "permanent error refreshing end offset");
                    self.park(e);
                    return false;
                }
            }
        }
        true
    }

    fn park(&self, e: ClientError) {
        let err = match e {
            ClientError::PartitionNotFound { ref partition } => {
                let partition = partition.clone();
                ReadError::permanent(&partition, e)
            }
            other => ReadError::Client(other),
        };
        if let Ok(mut slot) = self.error_slot.lock() {
            if slot.is_none() {
                *slot = Some(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::InMemoryBroker;
    use std::collections::HashSet;

    fn partitions(topic: &str, count: i32) -> Vec<Partition> {
        (0..count).map(|i| Partition::new(topic, i)).collect()
    }

    fn reader_for(
        broker: &InMemoryBroker,
        options: ReaderOptions,
    ) -> PartitionedReader<crate::test_utils::InMemoryPartitionClient> {
        let broker = broker.clone();
        PartitionedReader::new(Arc::new(move || Ok(broker.client())), options)
    }

    #[tokio::test]
    async fn advance_before_start_fails_fast() {
        let broker = InMemoryBroker::default();
        let mut reader = reader_for(&broker, ReaderOptions::new("g", partitions("t", 1)));
        assert!(matches!(reader.advance(), Err(ReadError::NotStarted)));
        assert!(matches!(reader.checkpoint_mark(), Err(ReadError::NotStarted)));
    }

    #[tokio::test]
    async fn operations_after_close_fail_with_closed() {
        let broker = InMemoryBroker::default();
        let mut reader = reader_for(&broker, ReaderOptions::new("g", partitions("t", 1)));
        reader.start().await.unwrap();
        reader.close().await;
        reader.close().await; // idempotent
        assert!(matches!(reader.advance(), Err(ReadError::Closed)));
        assert!(matches!(reader.checkpoint_mark(), Err(ReadError::Closed)));
    }

    #[tokio::test]
    async fn split_produces_disjoint_covering_subsets() {
        let broker = InMemoryBroker::default();
        let assigned = partitions("t", 20);
        let reader = reader_for(&broker, ReaderOptions::new("g", assigned.clone()));

        let splits = reader.split(7);
        assert_eq!(splits.len(), 7);

        let mut seen = HashSet::new();
        for sub in &splits {
            for partition in &sub.options().partitions {
                assert!(seen.insert(partition.clone()), "{partition} assigned twice");
            }
        }
        assert_eq!(seen.len(), assigned.len());
    }

    #[tokio::test]
    async fn split_is_capped_at_partition_count() {
        let broker = InMemoryBroker::default();
        let reader = reader_for(&broker, ReaderOptions::new("g", partitions("t", 3)));
        let splits = reader.split(10);
        assert_eq!(splits.len(), 3);
        for sub in &splits {
            assert_eq!(sub.options().partitions.len(), 1);
        }
    }

    #[tokio::test]
    async fn initialization_timeout_names_the_stuck_partition() {
        let broker = InMemoryBroker::default();
        let stuck = Partition::new("t", 1);
        broker.block_seeks(&stuck);
        let options = ReaderOptions::new("g", partitions("t", 2))
            .with_start_timeout(Duration::from_millis(100));
        let mut reader = reader_for(&broker, options);
        match reader.start().await {
            Err(ReadError::InitializationTimeout { partition, .. }) => {
                assert_eq!(partition, stuck);
            }
            other => panic!("expected initialization timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retried_start_rebuilds_cursors_from_scratch() {
        let broker = InMemoryBroker::default();
        let assigned = partitions("t", 2);
        for (i, partition) in assigned.iter().cycle().take(4).enumerate() {
            broker.produce(
                partition,
                None,
                bytes::Bytes::copy_from_slice(&(i as i64).to_be_bytes()),
                None,
            );
        }

        let stuck = assigned[1].clone();
        broker.block_seeks(&stuck);
        let options = ReaderOptions::new("g", assigned.clone())
            .with_start_timeout(Duration::from_millis(100));
        let mut reader = reader_for(&broker, options);
        assert!(matches!(
            reader.start().await,
            Err(ReadError::InitializationTimeout { .. })
        ));

        broker.unblock_seeks(&stuck);
        reader.start().await.unwrap();

        let mut read = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while read < 4 {
            if reader.advance().unwrap() {
                read += 1;
            } else {
                assert!(tokio::time::Instant::now() < deadline, "reader stalled");
                sleep(Duration::from_millis(2)).await;
            }
        }

        // One mark per partition; the failed first attempt must not leave a
        // stale duplicate behind that restore would resume from.
        let mark = reader.checkpoint_mark().unwrap();
        assert_eq!(mark.partitions().len(), 2);
        for partition in &assigned {
            assert_eq!(mark.mark_for(partition).map(|m| m.offset), Some(1));
        }
        reader.close().await;
    }

    #[tokio::test]
    async fn restore_requires_full_coverage() {
        let broker = InMemoryBroker::default();
        let mark = CheckpointMark::new(vec![PartitionMark {
            topic: "t".into(),
            partition: 0,
            offset: 4,
            timestamp: None,
        }]);
        let broker_clone = broker.clone();
        let mut reader = PartitionedReader::from_checkpoint(
            Arc::new(move || Ok(broker_clone.client())),
            ReaderOptions::new("g", partitions("t", 2)),
            mark,
        );
        assert!(matches!(reader.start().await, Err(ReadError::Decode(_))));
    }

    #[tokio::test]
    async fn explicit_offsets_must_cover_the_assignment() {
        let broker = InMemoryBroker::default();
        let offsets = std::collections::BTreeMap::from([(Partition::new("t", 0), 5i64)]);
        let options = ReaderOptions::new("g", partitions("t", 2))
            .with_start(StartReadPolicy::ExplicitOffsets(offsets));
        let mut reader = reader_for(&broker, options);
        assert!(matches!(
            reader.start().await,
            Err(ReadError::InvalidStartPosition(_))
        ));
    }
}
