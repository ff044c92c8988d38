//! In-memory broker doubles for tests.
//!
//! `InMemoryBroker` models the read side: partitioned append-only logs with
//! per-client assignment and positions, plus fault-injection knobs for
//! transient poll errors, stuck seeks, and vanished partitions.
//! `InMemorySinkBroker` models the write side: per-writer transactions whose
//! buffered records only become visible on commit.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;

use crate::client::{DeliveryFuture, PartitionClient, TransactionalWriter};
use crate::error::{ClientError, SinkError};
use crate::types::{LogPosition, Partition, Record, SinkRecord, TimestampType};

#[derive(Default)]
struct BrokerState {
    records: HashMap<Partition, Vec<Record>>,
    committed: HashMap<(String, Partition), i64>,
    blocked_seeks: HashSet<Partition>,
    transient_poll_failures: u32,
    missing_partition: Option<Partition>,
}

/// Shared in-memory log. Clone handles freely; every clone sees the same
/// records. Each [`InMemoryBroker::client`] call returns an independent
/// client with its own assignment and positions, mirroring how each reader
/// builds its own broker client from a factory.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn produce(
        &self,
        partition: &Partition,
        key: Option<Bytes>,
        payload: Bytes,
        timestamp: Option<DateTime<Utc>>,
    ) -> i64 {
        let mut state = self.state.lock().expect("broker state poisoned");
        let log = state.records.entry(partition.clone()).or_default();
        let offset = log.len() as i64;
        log.push(Record::new(
            partition.clone(),
            offset,
            key,
            Some(payload),
            timestamp,
            TimestampType::CreateTime,
        ));
        offset
    }

    pub fn client(&self) -> InMemoryPartitionClient {
        InMemoryPartitionClient {
            state: self.state.clone(),
            local: Mutex::new(ClientLocal::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn committed_offset(&self, group_id: &str, partition: &Partition) -> Option<i64> {
        let state = self.state.lock().expect("broker state poisoned");
        state
            .committed
            .get(&(group_id.to_string(), partition.clone()))
            .copied()
    }

    /// Seeks on this partition hang forever, for initialization-timeout
    /// scenarios.
    pub fn block_seeks(&self, partition: &Partition) {
        let mut state = self.state.lock().expect("broker state poisoned");
        state.blocked_seeks.insert(partition.clone());
    }

    /// Let seeks on this partition complete again.
    pub fn unblock_seeks(&self, partition: &Partition) {
        let mut state = self.state.lock().expect("broker state poisoned");
        state.blocked_seeks.remove(partition);
    }

    /// The next `n` polls fail with a transient error.
    pub fn fail_next_polls(&self, n: u32) {
        let mut state = self.state.lock().expect("broker state poisoned");
        state.transient_poll_failures = n;
    }

    /// Polls fail permanently, as if this partition no longer exists.
    pub fn drop_partition(&self, partition: &Partition) {
        let mut state = self.state.lock().expect("broker state poisoned");
        state.missing_partition = Some(partition.clone());
    }
}

#[derive(Default)]
struct ClientLocal {
    assigned: Vec<Partition>,
    positions: HashMap<Partition, i64>,
    rr: usize,
}

pub struct InMemoryPartitionClient {
    state: Arc<Mutex<BrokerState>>,
    local: Mutex<ClientLocal>,
    closed: AtomicBool,
}

impl InMemoryPartitionClient {
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PartitionClient for InMemoryPartitionClient {
    async fn assign(&self, partitions: &[Partition]) -> Result<(), ClientError> {
        self.check_open()?;
        let mut local = self.local.lock().expect("client state poisoned");
        local.assigned = partitions.to_vec();
        local.rr = 0;
        Ok(())
    }

    async fn seek(&self, partition: &Partition, offset: i64) -> Result<(), ClientError> {
        self.check_open()?;
        let blocked = {
            let state = self.state.lock().expect("broker state poisoned");
            state.blocked_seeks.contains(partition)
        };
        if blocked {
            // Hang until the caller's deadline fires.
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
        let mut local = self.local.lock().expect("client state poisoned");
        local.positions.insert(partition.clone(), offset);
        Ok(())
    }

    async fn poll(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, ClientError> {
        self.check_open()?;
        let out = {
            let mut state = self.state.lock().expect("broker state poisoned");
            if let Some(partition) = &state.missing_partition {
                return Err(ClientError::PartitionNotFound {
                    partition: partition.clone(),
                });
            }
            if state.transient_poll_failures > 0 {
                state.transient_poll_failures -= 1;
                return Err(ClientError::Transient("injected poll failure".into()));
            }

            let mut local = self.local.lock().expect("client state poisoned");
            let assigned = local.assigned.clone();
            let mut out = Vec::new();
            if !assigned.is_empty() {
                let start = local.rr % assigned.len();
                for i in 0..assigned.len() {
                    if out.len() >= max_records {
                        break;
                    }
                    let partition = &assigned[(start + i) % assigned.len()];
                    let position = local.positions.get(partition).copied().unwrap_or(0);
                    let log = state.records.get(partition);
                    let available = log
                        .map(|l| &l[(position.min(l.len() as i64) as usize)..])
                        .unwrap_or(&[]);
                    let take = available.len().min(max_records - out.len());
                    out.extend_from_slice(&available[..take]);
                    local
                        .positions
                        .insert(partition.clone(), position + take as i64);
                }
                local.rr = local.rr.wrapping_add(1);
            }
            out
        };
        if out.is_empty() {
            // Model a broker poll waiting briefly for data.
            tokio::time::sleep(timeout.min(Duration::from_millis(2))).await;
        }
        Ok(out)
    }

    async fn offsets_for_timestamps(
        &self,
        timestamps: &HashMap<Partition, DateTime<Utc>>,
    ) -> Result<HashMap<Partition, Option<i64>>, ClientError> {
        self.check_open()?;
        let state = self.state.lock().expect("broker state poisoned");
        let mut resolved = HashMap::new();
        for (partition, timestamp) in timestamps {
            let offset = state.records.get(partition).and_then(|log| {
                log.iter()
                    .find(|r| r.timestamp().is_some_and(|ts| ts >= *timestamp))
                    .map(|r| r.offset())
            });
            resolved.insert(partition.clone(), offset);
        }
        Ok(resolved)
    }

    async fn beginning_offset(&self, _partition: &Partition) -> Result<i64, ClientError> {
        self.check_open()?;
        Ok(0)
    }

    async fn end_offset(&self, partition: &Partition) -> Result<i64, ClientError> {
        self.check_open()?;
        let state = self.state.lock().expect("broker state poisoned");
        Ok(state.records.get(partition).map(|l| l.len() as i64).unwrap_or(0))
    }

    async fn commit_offsets(
        &self,
        group_id: &str,
        offsets: &[LogPosition],
    ) -> Result<(), ClientError> {
        self.check_open()?;
        let mut state = self.state.lock().expect("broker state poisoned");
        for position in offsets {
            state.committed.insert(
                (group_id.to_string(), position.partition().clone()),
                position.offset(),
            );
        }
        Ok(())
    }
}

#[derive(Default)]
struct SinkState {
    visible: Vec<(usize, SinkRecord)>,
    committed: HashMap<(String, Partition), i64>,
    fail_next_sends: u32,
    fail_next_commits: u32,
    send_attempts: u64,
}

/// Shared sink-side broker double. Writers buffer records per transaction;
/// only committed records appear in `visible`, tagged with the writer id
/// that produced them.
#[derive(Clone, Default)]
pub struct InMemorySinkBroker {
    state: Arc<Mutex<SinkState>>,
}

impl InMemorySinkBroker {
    pub fn writer(&self, id: usize) -> InMemoryTransactionalWriter {
        InMemoryTransactionalWriter {
            id,
            state: self.state.clone(),
            in_transaction: false,
            buffered: Vec::new(),
            staged_offsets: Vec::new(),
            closed: false,
        }
    }

    pub fn visible(&self) -> Vec<(usize, SinkRecord)> {
        self.state.lock().expect("sink state poisoned").visible.clone()
    }

    pub fn visible_payloads(&self) -> Vec<Bytes> {
        self.visible()
            .into_iter()
            .map(|(_, record)| record.payload().clone())
            .collect()
    }

    pub fn committed_offset(&self, group_id: &str, partition: &Partition) -> Option<i64> {
        let state = self.state.lock().expect("sink state poisoned");
        state
            .committed
            .get(&(group_id.to_string(), partition.clone()))
            .copied()
    }

    /// The next `n` sends are rejected: their delivery futures resolve to an
    /// error and the records are not appended.
    pub fn fail_next_sends(&self, n: u32) {
        self.state.lock().expect("sink state poisoned").fail_next_sends = n;
    }

    /// The next `n` commits fail; the broker discards the transaction as if
    /// the producer had been fenced.
    pub fn fail_next_commits(&self, n: u32) {
        self.state.lock().expect("sink state poisoned").fail_next_commits = n;
    }

    pub fn send_attempts(&self) -> u64 {
        self.state.lock().expect("sink state poisoned").send_attempts
    }
}

pub struct InMemoryTransactionalWriter {
    id: usize,
    state: Arc<Mutex<SinkState>>,
    in_transaction: bool,
    buffered: Vec<SinkRecord>,
    staged_offsets: Vec<(String, LogPosition)>,
    closed: bool,
}

#[async_trait]
impl TransactionalWriter for InMemoryTransactionalWriter {
    async fn begin_transaction(&mut self, _epoch: u64) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        if self.in_transaction {
            return Err(SinkError::Writer("transaction already open".into()));
        }
        self.buffered.clear();
        self.staged_offsets.clear();
        self.in_transaction = true;
        Ok(())
    }

    async fn send(&mut self, record: SinkRecord) -> Result<DeliveryFuture, SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        let rejected = {
            let mut state = self.state.lock().expect("sink state poisoned");
            state.send_attempts += 1;
            if state.fail_next_sends > 0 {
                state.fail_next_sends -= 1;
                true
            } else {
                if self.in_transaction {
                    self.buffered.push(record);
                } else {
                    state.visible.push((self.id, record));
                }
                false
            }
        };
        let result = if rejected {
            Err("injected send failure".to_string())
        } else {
            Ok(())
        };
        Ok(futures::future::ready(result).boxed())
    }

    async fn send_offsets(
        &mut self,
        group_id: &str,
        offsets: &[LogPosition],
    ) -> Result<(), SinkError> {
        if !self.in_transaction {
            return Err(SinkError::Writer("no open transaction".into()));
        }
        for position in offsets {
            self.staged_offsets.push((group_id.to_string(), position.clone()));
        }
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<(), SinkError> {
        if !self.in_transaction {
            return Err(SinkError::Writer("no open transaction".into()));
        }
        self.in_transaction = false;
        let mut state = self.state.lock().expect("sink state poisoned");
        if state.fail_next_commits > 0 {
            state.fail_next_commits -= 1;
            self.buffered.clear();
            self.staged_offsets.clear();
            return Err(SinkError::CommitConflict {
                shard: self.id,
                reason: "injected commit failure".into(),
            });
        }
        for record in self.buffered.drain(..) {
            state.visible.push((self.id, record));
        }
        for (group_id, position) in self.staged_offsets.drain(..) {
            let key = (group_id, position.partition().clone());
            let entry = state.committed.entry(key).or_insert(position.offset());
            if position.offset() > *entry {
                *entry = position.offset();
            }
        }
        Ok(())
    }

    async fn abort_transaction(&mut self) -> Result<(), SinkError> {
        self.buffered.clear();
        self.staged_offsets.clear();
        self.in_transaction = false;
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
