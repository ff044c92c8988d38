use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerGroupMetadata};
use rdkafka::message::{Message, Timestamp};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::debug;

use super::classify;
use crate::client::PartitionClient;
use crate::config::BrokerConfig;
use crate::error::ClientError;
use crate::types::{LogPosition, Partition, Record, TimestampType};

/// Manual-assignment consumer adapter. All broker calls run on the blocking
/// pool; the consumer handle itself is thread-safe.
pub struct KafkaPartitionClient {
    consumer: Arc<BaseConsumer>,
    operation_timeout: Duration,
    // librdkafka rejects seeks issued before the first fetch, so positioning
    // is done by reassigning the full partition list with explicit offsets.
    assignment: Mutex<AssignmentState>,
}

#[derive(Default)]
struct AssignmentState {
    partitions: Vec<Partition>,
    positions: HashMap<Partition, i64>,
}

impl KafkaPartitionClient {
    pub fn from_config(config: &BrokerConfig, group_id: &str) -> Result<Self, ClientError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.broker_hosts)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest");

        if config.broker_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: BaseConsumer = client_config.create().map_err(|e| classify(e, None))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            operation_timeout: config.operation_timeout(),
            assignment: Mutex::new(AssignmentState::default()),
        })
    }

    /// Consumer-group metadata for transactional offset commits. `None`
    /// until the underlying consumer has joined its group.
    pub fn group_metadata(&self) -> Option<ConsumerGroupMetadata> {
        self.consumer.group_metadata()
    }

    fn assignment_snapshot(&self) -> (Vec<Partition>, HashMap<Partition, i64>) {
        match self.assignment.lock() {
            Ok(state) => (state.partitions.clone(), state.positions.clone()),
            Err(_) => (Vec::new(), HashMap::new()),
        }
    }

    fn apply_assignment(
        consumer: &BaseConsumer,
        partitions: &[Partition],
        positions: &HashMap<Partition, i64>,
    ) -> Result<(), ClientError> {
        let mut tpl = TopicPartitionList::new();
        for partition in partitions {
            let offset = positions
                .get(partition)
                .map(|o| Offset::Offset(*o))
                .unwrap_or(Offset::Invalid);
            tpl.add_partition_offset(partition.topic(), partition.partition_number(), offset)
                .map_err(|e| classify(e, Some(partition)))?;
        }
        consumer.assign(&tpl).map_err(|e| classify(e, None))
    }
}

fn record_from_message(message: &rdkafka::message::BorrowedMessage<'_>) -> Record {
    let (timestamp, timestamp_type) = match message.timestamp() {
        Timestamp::CreateTime(ms) => (
            Utc.timestamp_millis_opt(ms).single(),
            TimestampType::CreateTime,
        ),
        Timestamp::LogAppendTime(ms) => (
            Utc.timestamp_millis_opt(ms).single(),
            TimestampType::LogAppendTime,
        ),
        Timestamp::NotAvailable => (None, TimestampType::NotAvailable),
    };
    Record::new(
        Partition::new(message.topic(), message.partition()),
        message.offset(),
        message.key().map(bytes::Bytes::copy_from_slice),
        message.payload().map(bytes::Bytes::copy_from_slice),
        timestamp,
        timestamp_type,
    )
}

#[async_trait]
impl PartitionClient for KafkaPartitionClient {
    async fn assign(&self, partitions: &[Partition]) -> Result<(), ClientError> {
        let positions = {
            let mut state = self
                .assignment
                .lock()
                .map_err(|_| ClientError::Other("assignment state poisoned".into()))?;
            state.partitions = partitions.to_vec();
            let assigned = state.partitions.clone();
            state.positions.retain(|p, _| assigned.contains(p));
            state.positions.clone()
        };
        let consumer = self.consumer.clone();
        let partitions = partitions.to_vec();
        tokio::task::spawn_blocking(move || {
            Self::apply_assignment(&consumer, &partitions, &positions)
        })
        .await
        .map_err(|e| ClientError::Other(format!("assign task failed: {e}")))?
    }

    async fn seek(&self, partition: &Partition, offset: i64) -> Result<(), ClientError> {
        let (partitions, positions) = {
            let mut state = self
                .assignment
                .lock()
                .map_err(|_| ClientError::Other("assignment state poisoned".into()))?;
            state.positions.insert(partition.clone(), offset);
            (state.partitions.clone(), state.positions.clone())
        };
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || {
            Self::apply_assignment(&consumer, &partitions, &positions)
        })
        .await
        .map_err(|e| ClientError::Other(format!("seek task failed: {e}")))?
    }

    async fn poll(
        &self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, ClientError> {
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + timeout;
            let mut out = Vec::new();
            while out.len() < max_records {
                // The first poll waits for data; once a batch has started,
                // drain without waiting.
                let wait = if out.is_empty() {
                    deadline.saturating_duration_since(Instant::now())
                } else {
                    Duration::ZERO
                };
                match consumer.poll(wait) {
                    Some(Ok(message)) => out.push(record_from_message(&message)),
                    Some(Err(e)) => return Err(classify(e, None)),
                    None => break,
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| ClientError::Other(format!("poll task failed: {e}")))?
    }

    async fn offsets_for_timestamps(
        &self,
        timestamps: &HashMap<Partition, DateTime<Utc>>,
    ) -> Result<HashMap<Partition, Option<i64>>, ClientError> {
        let consumer = self.consumer.clone();
        let operation_timeout = self.operation_timeout;
        let requested: Vec<(Partition, i64)> = timestamps
            .iter()
            .map(|(p, ts)| (p.clone(), ts.timestamp_millis()))
            .collect();
        tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            for (partition, timestamp_ms) in &requested {
                // The librdkafka lookup encodes the timestamp in the offset
                // field of the request list.
                tpl.add_partition_offset(
                    partition.topic(),
                    partition.partition_number(),
                    Offset::Offset(*timestamp_ms),
                )
                .map_err(|e| classify(e, Some(partition)))?;
            }
            let resolved = consumer
                .offsets_for_times(tpl, operation_timeout)
                .map_err(|e| classify(e, None))?;
            let mut out = HashMap::new();
            for elem in resolved.elements() {
                let partition = Partition::new(elem.topic(), elem.partition());
                let offset = match elem.offset() {
                    Offset::Offset(o) => Some(o),
                    _ => None,
                };
                out.insert(partition, offset);
            }
            Ok(out)
        })
        .await
        .map_err(|e| ClientError::Other(format!("offset lookup task failed: {e}")))?
    }

    async fn beginning_offset(&self, partition: &Partition) -> Result<i64, ClientError> {
        let consumer = self.consumer.clone();
        let operation_timeout = self.operation_timeout;
        let partition = partition.clone();
        tokio::task::spawn_blocking(move || {
            consumer
                .fetch_watermarks(
                    partition.topic(),
                    partition.partition_number(),
                    operation_timeout,
                )
                .map(|(low, _high)| low)
                .map_err(|e| classify(e, Some(&partition)))
        })
        .await
        .map_err(|e| ClientError::Other(format!("watermark task failed: {e}")))?
    }

    async fn end_offset(&self, partition: &Partition) -> Result<i64, ClientError> {
        let consumer = self.consumer.clone();
        let operation_timeout = self.operation_timeout;
        let partition = partition.clone();
        tokio::task::spawn_blocking(move || {
            consumer
                .fetch_watermarks(
                    partition.topic(),
                    partition.partition_number(),
                    operation_timeout,
                )
                .map(|(_low, high)| high)
                .map_err(|e| classify(e, Some(&partition)))
        })
        .await
        .map_err(|e| ClientError::Other(format!("watermark task failed: {e}")))?
    }

    async fn commit_offsets(
        &self,
        _group_id: &str,
        offsets: &[LogPosition],
    ) -> Result<(), ClientError> {
        // The group is fixed at construction; commits always target it.
        let consumer = self.consumer.clone();
        let offsets = offsets.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            for position in &offsets {
                tpl.add_partition_offset(
                    position.topic(),
                    position.partition_number(),
                    Offset::Offset(position.offset()),
                )
                .map_err(|e| classify(e, Some(position.partition())))?;
            }
            consumer
                .commit(&tpl, rdkafka::consumer::CommitMode::Sync)
                .map_err(|e| classify(e, None))
        })
        .await
        .map_err(|e| ClientError::Other(format!("commit task failed: {e}")))?
    }
}
