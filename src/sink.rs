//! Exactly-once-capable sink.
//!
//! Records are routed by shard key to per-shard transactional writers. Each
//! shard buffers sends inside an open transaction; on bundle completion the
//! sink commits buffered records together with the consumer-group offsets
//! that suppress duplicate replays, or aborts so a redriven bundle starts
//! from a clean slate. Exactly-once emerges from idempotent replay plus
//! atomic commit, not from internal deduplication.
//!
//! A completion-resolution task per shard settles in-flight delivery futures
//! off the write path, so submission is decoupled from broker round-trip
//! latency. In-flight sends are capped per shard; acquiring a permit is the
//! backpressure point.

use std::hash::Hasher;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use metrics::counter;
use siphasher::sip::SipHasher13;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{DeliveryFuture, TransactionalWriter};
use crate::config::SinkOptions;
use crate::error::SinkError;
use crate::metric_consts::{RECORDS_WRITTEN, TRANSACTIONS_ABORTED, TRANSACTIONS_COMMITTED};
use crate::types::{LogPosition, SinkRecord};

/// Delivery contract the sink operates under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Sends are asynchronous; the first observed send error is captured and
    /// re-raised on the next call. Duplicates are possible on redrive.
    AtLeastOnce,
    /// Sends are buffered in per-shard transactions committed atomically
    /// with consumer-group offsets on bundle completion.
    ExactlyOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardState {
    Idle,
    Sending,
    Committing,
    Aborting,
}

enum Completion {
    Settle(DeliveryFuture, OwnedSemaphorePermit),
    Flush(oneshot::Sender<Option<SinkError>>),
}

/// Handle to a shard's completion-resolution task.
struct CompletionHandle {
    tx: Option<mpsc::UnboundedSender<Completion>>,
    first_error: Arc<Mutex<Option<SinkError>>>,
    task: Option<JoinHandle<()>>,
}

impl CompletionHandle {
    fn spawn(shard: usize) -> Self {
        let first_error: Arc<Mutex<Option<SinkError>>> = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_completions(shard, rx, first_error.clone()));
        Self {
            tx: Some(tx),
            first_error,
            task: Some(task),
        }
    }

    fn submit(&self, delivery: DeliveryFuture, permit: OwnedSemaphorePermit) -> Result<(), SinkError> {
        self.tx
            .as_ref()
            .ok_or(SinkError::Closed)?
            .send(Completion::Settle(delivery, permit))
            .map_err(|_| SinkError::Closed)
    }

    /// Wait for every submitted delivery to settle; returns the first error
    /// observed since the previous flush.
    async fn flush(&self) -> Result<(), SinkError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .as_ref()
            .ok_or(SinkError::Closed)?
            .send(Completion::Flush(done_tx))
            .map_err(|_| SinkError::Closed)?;
        match done_rx.await {
            Ok(Some(err)) => Err(err),
            Ok(None) => Ok(()),
            Err(_) => Err(SinkError::Closed),
        }
    }

    /// Take the first asynchronously observed error, clearing the slot.
    fn take_error(&self) -> Option<SinkError> {
        self.first_error.lock().ok().and_then(|mut slot| slot.take())
    }

    async fn close(&mut self) {
        self.tx = None;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "completion task did not shut down cleanly");
            }
        }
    }
}

async fn run_completions(
    shard: usize,
    mut rx: mpsc::UnboundedReceiver<Completion>,
    slot: Arc<Mutex<Option<SinkError>>>,
) {
    let mut pending: FuturesUnordered<BoxFuture<'static, Result<(), String>>> =
        FuturesUnordered::new();
    // First error since the last flush; handed back on Flush.
    let mut flush_error: Option<SinkError> = None;

    fn settle(
        shard: usize,
        result: Result<(), String>,
        flush_error: &mut Option<SinkError>,
        slot: &Mutex<Option<SinkError>>,
    ) {
        if let Err(reason) = result {
            warn!(shard, reason, "send was not acknowledged");
            if flush_error.is_none() {
                *flush_error = Some(SinkError::Send {
                    shard,
                    reason: reason.clone(),
                });
            }
            if let Ok(mut first) = slot.lock() {
                if first.is_none() {
                    *first = Some(SinkError::Send { shard, reason });
                }
            }
        }
    }

    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(Completion::Settle(delivery, permit)) => {
                    pending.push(
                        async move {
                            // The permit is held until the broker answers,
                            // which is what bounds in-flight sends.
                            let _permit = permit;
                            delivery.await
                        }
                        .boxed(),
                    );
                }
                Some(Completion::Flush(done)) => {
                    while let Some(result) = pending.next().await {
                        settle(shard, result, &mut flush_error, &slot);
                    }
                    let _ = done.send(flush_error.take());
                }
                None => {
                    while let Some(result) = pending.next().await {
                        settle(shard, result, &mut flush_error, &slot);
                    }
                    return;
                }
            },
            Some(result) = pending.next(), if !pending.is_empty() => {
                settle(shard, result, &mut flush_error, &slot);
            }
        }
    }
}

/// One shard: a transactional writer exclusively owned by this sink, its
/// state machine, and its completion task.
struct ShardWriter<W: TransactionalWriter> {
    index: usize,
    writer: W,
    state: ShardState,
    epoch: u64,
    completions: CompletionHandle,
    permits: Arc<Semaphore>,
}

impl<W: TransactionalWriter> ShardWriter<W> {
    fn new(index: usize, writer: W, max_in_flight: usize) -> Self {
        Self {
            index,
            writer,
            state: ShardState::Idle,
            epoch: 0,
            completions: CompletionHandle::spawn(index),
            permits: Arc::new(Semaphore::new(max_in_flight)),
        }
    }

    fn has_open_transaction(&self) -> bool {
        self.state == ShardState::Sending
    }

    async fn open_transaction(&mut self) -> Result<(), SinkError> {
        self.epoch += 1;
        self.writer.begin_transaction(self.epoch).await?;
        self.state = ShardState::Sending;
        debug!(shard = self.index, epoch = self.epoch, "transaction opened");
        Ok(())
    }

    async fn write(&mut self, mode: DeliveryMode, record: SinkRecord) -> Result<(), SinkError> {
        if let Some(err) = self.completions.take_error() {
            // Fail fast: an asynchronous send error must never be swallowed.
            if self.has_open_transaction() {
                self.abort_quietly().await;
            }
            return Err(err);
        }

        if mode == DeliveryMode::ExactlyOnce && self.state == ShardState::Idle {
            self.open_transaction().await?;
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SinkError::Closed)?;
        let delivery = self.writer.send(record).await?;
        self.completions.submit(delivery, permit)?;
        counter!(RECORDS_WRITTEN, "shard" => self.index.to_string()).increment(1);
        Ok(())
    }

    /// Resolve every in-flight send for the current bundle.
    async fn flush_bundle(&mut self) -> Result<(), SinkError> {
        let result = self.completions.flush().await;
        // The flush result and the fail-fast slot carry the same failure;
        // clear the slot so a redriven bundle starts clean.
        let _ = self.completions.take_error();
        result
    }

    /// Commit the open transaction together with the consumer offsets.
    /// Callers must have flushed successfully first.
    async fn commit_bundle(
        &mut self,
        group_id: &str,
        offsets: &[LogPosition],
    ) -> Result<(), SinkError> {
        self.state = ShardState::Committing;
        if let Err(e) = self.writer.send_offsets(group_id, offsets).await {
            self.abort_quietly().await;
            return Err(e);
        }
        match self.writer.commit_transaction().await {
            Ok(()) => {
                counter!(TRANSACTIONS_COMMITTED, "shard" => self.index.to_string()).increment(1);
                debug!(shard = self.index, epoch = self.epoch, "transaction committed");
                self.state = ShardState::Idle;
                Ok(())
            }
            Err(e) => {
                self.abort_quietly().await;
                Err(e)
            }
        }
    }

    /// Abort whatever transaction is open, swallowing abort-side errors.
    /// Buffered records become invisible and offsets do not advance.
    async fn abort_quietly(&mut self) {
        if self.state == ShardState::Idle {
            return;
        }
        self.state = ShardState::Aborting;
        if let Err(e) = self.writer.abort_transaction().await {
            warn!(shard = self.index, error = %e, "abort reported an error");
        }
        counter!(TRANSACTIONS_ABORTED, "shard" => self.index.to_string()).increment(1);
        let _ = self.completions.take_error();
        self.state = ShardState::Idle;
    }

    async fn close(&mut self) {
        if self.has_open_transaction() {
            let _ = self.flush_bundle().await;
            self.abort_quietly().await;
        }
        self.completions.close().await;
        self.writer.close().await;
    }
}

/// Routes outgoing records to per-shard transactional writers and drives
/// their commit/abort lifecycle.
pub struct ExactlyOnceSink<W: TransactionalWriter> {
    mode: DeliveryMode,
    group_id: String,
    shards: Vec<ShardWriter<W>>,
    rr_next: usize,
    closed: bool,
}

impl<W: TransactionalWriter> ExactlyOnceSink<W> {
    /// One writer per shard; each writer is exclusively owned by its shard
    /// for the sink's lifetime.
    pub fn new(options: SinkOptions, writers: Vec<W>) -> Result<Self, SinkError> {
        if writers.is_empty() {
            return Err(SinkError::Writer("sink requires at least one writer".into()));
        }
        let shards = writers
            .into_iter()
            .enumerate()
            .map(|(index, writer)| ShardWriter::new(index, writer, options.max_in_flight))
            .collect();
        Ok(Self {
            mode: options.mode,
            group_id: options.group_id,
            shards,
            rr_next: 0,
            closed: false,
        })
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// The shard a record routes to: a stable hash of the shard key, or
    /// round-robin for keyless records. A logical shard always maps to the
    /// same writer, preserving ordering and the exactly-once contract.
    fn shard_index(&mut self, record: &SinkRecord) -> usize {
        match record.shard_key() {
            Some(key) => {
                let mut hasher = SipHasher13::new();
                hasher.write(key);
                (hasher.finish() % self.shards.len() as u64) as usize
            }
            None => {
                let index = self.rr_next % self.shards.len();
                self.rr_next = index + 1;
                index
            }
        }
    }

    pub async fn write(&mut self, record: SinkRecord) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        let index = self.shard_index(&record);
        let mode = self.mode;
        self.shards[index].write(mode, record).await
    }

    /// Complete the bundle. In exactly-once mode this resolves all in-flight
    /// sends, then commits every open transaction together with `offsets`;
    /// any failure aborts every open transaction so the redriven bundle
    /// replays onto a clean slate. A bundle that wrote no records commits
    /// `offsets` through a single transaction. In at-least-once mode it only
    /// drains in-flight sends and surfaces the first error.
    pub async fn finalize_bundle(&mut self, offsets: &[LogPosition]) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }

        let mut first_error: Option<SinkError> = None;
        for shard in &mut self.shards {
            if self.mode == DeliveryMode::ExactlyOnce && !shard.has_open_transaction() {
                continue;
            }
            if let Err(e) = shard.flush_bundle().await {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        if self.mode == DeliveryMode::AtLeastOnce {
            return match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }

        if let Some(e) = first_error {
            self.abort_bundle().await;
            return Err(e);
        }

        // A bundle that wrote no records still advances the consumer offsets
        // that produced it, so an empty bundle is not replayed forever.
        if !offsets.is_empty() && !self.shards.iter().any(|s| s.has_open_transaction()) {
            self.shards[0].open_transaction().await?;
        }

        for i in 0..self.shards.len() {
            if !self.shards[i].has_open_transaction() {
                continue;
            }
            if let Err(e) = self.shards[i].commit_bundle(&self.group_id, offsets).await {
                // Later shards must not commit a bundle that already failed.
                self.abort_bundle().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Abort every open transaction. Called on upstream failure; the bundle
    /// is replayed from scratch by the surrounding execution framework.
    pub async fn abort_bundle(&mut self) {
        for shard in &mut self.shards {
            shard.abort_quietly().await;
        }
    }

    /// Abort open transactions and release all writers. Idempotent;
    /// subsequent operations fail with `Closed`.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for shard in &mut self.shards {
            shard.close().await;
        }
        info!(group_id = self.group_id, "sink closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{InMemorySinkBroker, InMemoryTransactionalWriter};
    use bytes::Bytes;

    fn keyed(key: &str, payload: &str) -> SinkRecord {
        SinkRecord::new(
            "out",
            Some(Bytes::copy_from_slice(key.as_bytes())),
            Bytes::copy_from_slice(payload.as_bytes()),
            None,
        )
    }

    fn keyless(payload: &str) -> SinkRecord {
        SinkRecord::new("out", None, Bytes::copy_from_slice(payload.as_bytes()), None)
    }

    fn sink_with_shards(
        broker: &InMemorySinkBroker,
        shards: usize,
        mode: DeliveryMode,
    ) -> ExactlyOnceSink<InMemoryTransactionalWriter> {
        let writers = (0..shards).map(|i| broker.writer(i)).collect();
        ExactlyOnceSink::new(SinkOptions::new("group", shards).with_mode(mode), writers).unwrap()
    }

    #[tokio::test]
    async fn same_key_always_routes_to_the_same_shard() {
        let broker = InMemorySinkBroker::default();
        let mut sink = sink_with_shards(&broker, 4, DeliveryMode::ExactlyOnce);

        for i in 0..20 {
            sink.write(keyed("stable-key", &format!("v{i}"))).await.unwrap();
        }
        sink.finalize_bundle(&[]).await.unwrap();

        let writers: std::collections::HashSet<usize> = broker
            .visible()
            .iter()
            .map(|(writer_id, _)| *writer_id)
            .collect();
        assert_eq!(writers.len(), 1);
    }

    #[tokio::test]
    async fn keyless_records_spread_round_robin() {
        let broker = InMemorySinkBroker::default();
        let mut sink = sink_with_shards(&broker, 3, DeliveryMode::ExactlyOnce);

        for i in 0..9 {
            sink.write(keyless(&format!("v{i}"))).await.unwrap();
        }
        sink.finalize_bundle(&[]).await.unwrap();

        let mut per_writer = std::collections::HashMap::new();
        for (writer_id, _) in broker.visible() {
            *per_writer.entry(writer_id).or_insert(0) += 1;
        }
        assert_eq!(per_writer.len(), 3);
        assert!(per_writer.values().all(|&count| count == 3));
    }

    #[tokio::test]
    async fn records_are_invisible_until_commit() {
        let broker = InMemorySinkBroker::default();
        let mut sink = sink_with_shards(&broker, 1, DeliveryMode::ExactlyOnce);

        sink.write(keyed("k", "v")).await.unwrap();
        assert!(broker.visible().is_empty());

        sink.finalize_bundle(&[]).await.unwrap();
        assert_eq!(broker.visible().len(), 1);
    }

    #[tokio::test]
    async fn abort_discards_buffered_records() {
        let broker = InMemorySinkBroker::default();
        let mut sink = sink_with_shards(&broker, 1, DeliveryMode::ExactlyOnce);

        sink.write(keyed("k", "doomed")).await.unwrap();
        sink.abort_bundle().await;
        sink.finalize_bundle(&[]).await.unwrap();
        assert!(broker.visible().is_empty());
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let broker = InMemorySinkBroker::default();
        let mut sink = sink_with_shards(&broker, 1, DeliveryMode::AtLeastOnce);
        sink.close().await;
        sink.close().await; // idempotent
        assert!(matches!(sink.write(keyed("k", "v")).await, Err(SinkError::Closed)));
    }
}
