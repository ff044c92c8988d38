use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single partition of a stream: an independently ordered, append-only log
/// identified by (topic, partition number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition_number)
    }
}

/// A position within one partition. Offsets are totally ordered within a
/// partition and carry no ordering across partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogPosition {
    partition: Partition,
    offset: i64,
}

impl LogPosition {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

/// How the broker assigned the producer timestamp carried on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampType {
    CreateTime,
    LogAppendTime,
    NotAvailable,
}

/// A single record fetched from a partition. Immutable once fetched.
#[derive(Debug, Clone)]
pub struct Record {
    partition: Partition,
    offset: i64,
    key: Option<Bytes>,
    payload: Option<Bytes>,
    timestamp: Option<DateTime<Utc>>,
    timestamp_type: TimestampType,
}

impl Record {
    pub fn new(
        partition: Partition,
        offset: i64,
        key: Option<Bytes>,
        payload: Option<Bytes>,
        timestamp: Option<DateTime<Utc>>,
        timestamp_type: TimestampType,
    ) -> Self {
        Self {
            partition,
            offset,
            key,
            payload,
            timestamp,
            timestamp_type,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.partition.clone(), self.offset)
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn timestamp_type(&self) -> TimestampType {
        self.timestamp_type
    }

    /// Approximate wire size of the record, used for byte-level metrics and
    /// backlog estimates.
    pub fn size_bytes(&self) -> usize {
        self.key.as_ref().map(|k| k.len()).unwrap_or(0)
            + self.payload.as_ref().map(|p| p.len()).unwrap_or(0)
            + self.partition.topic().len()
    }
}

/// Where a fresh reader (one without a checkpoint to resume from) begins
/// reading on each assigned partition.
#[derive(Debug, Clone)]
pub enum StartReadPolicy {
    /// Start at the beginning offset of every partition.
    Earliest,
    /// Start at the end offset of every partition, reading only new records.
    Latest,
    /// Start at the first offset whose record timestamp is at or after the
    /// given time. Partitions with no such record start at their end offset.
    Timestamp(DateTime<Utc>),
    /// Start at an explicit offset per partition. Every assigned partition
    /// must be present in the map.
    ExplicitOffsets(BTreeMap<Partition, i64>),
}

/// An outgoing record handed to the sink. The shard key determines which
/// transactional writer handles it; records without a key are spread
/// round-robin.
#[derive(Debug, Clone)]
pub struct SinkRecord {
    topic: String,
    shard_key: Option<Bytes>,
    payload: Bytes,
    timestamp: Option<DateTime<Utc>>,
}

impl SinkRecord {
    pub fn new(
        topic: impl Into<String>,
        shard_key: Option<Bytes>,
        payload: Bytes,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            shard_key,
            payload,
            timestamp,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn shard_key(&self) -> Option<&Bytes> {
        self.shard_key.as_ref()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }
}
