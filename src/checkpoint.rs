//! Durable snapshot of reader progress.
//!
//! A mark records, per assigned partition, the last offset the reader
//! emitted and the timestamp it was stamped with. The mark itself is
//! authoritative for resumption; committing the offsets back to the broker's
//! consumer-group bookkeeping on finalize is best-effort convenience for
//! external lag monitoring.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::client::PartitionClient;
use crate::error::ReadError;
use crate::metric_consts::CHECKPOINT_COMMITS_ENQUEUED;
use crate::types::{LogPosition, Partition};

/// Progress of one partition at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMark {
    pub topic: String,
    pub partition: i32,
    /// Last delivered offset; resumption continues at `offset + 1`.
    pub offset: i64,
    /// Timestamp stamped on the last delivered record, if any. Seeds the
    /// restored partition's watermark floor.
    pub timestamp: Option<DateTime<Utc>>,
}

impl PartitionMark {
    pub fn partition(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }
}

/// Immutable snapshot of all assigned partitions' offsets. Created on
/// demand, consumed exactly once at restart. Entries are kept sorted by
/// (topic, partition) so the wire format is stable across restarts for a
/// fixed assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMark {
    partitions: Vec<PartitionMark>,
}

impl CheckpointMark {
    pub fn new(mut partitions: Vec<PartitionMark>) -> Self {
        partitions.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        Self { partitions }
    }

    pub fn partitions(&self) -> &[PartitionMark] {
        &self.partitions
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// The entry for `partition`, if the mark covers it.
    pub fn mark_for(&self, partition: &Partition) -> Option<&PartitionMark> {
        self.partitions
            .iter()
            .find(|m| m.topic == partition.topic() && m.partition == partition.partition_number())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ReadError> {
        serde_json::to_vec(self).map_err(|e| ReadError::Encode(e.to_string()))
    }

    /// Decode a previously encoded mark. Malformed input is fatal; a start
    /// position is never guessed from a corrupt mark.
    pub fn decode(bytes: &[u8]) -> Result<Self, ReadError> {
        let mark: CheckpointMark =
            serde_json::from_slice(bytes).map_err(|e| ReadError::Decode(e.to_string()))?;
        Ok(CheckpointMark::new(mark.partitions))
    }

    /// Called once the snapshot is durably recorded downstream.
    /// Opportunistically commits the snapshotted offsets to the broker's
    /// consumer-group bookkeeping. Best-effort only: failure is logged and
    /// never fatal, since the mark itself is what resumption relies on.
    pub async fn finalize<C: PartitionClient>(&self, client: &C, group_id: &str) {
        if self.partitions.is_empty() {
            return;
        }
        // Broker convention: commit the next offset to read.
        let offsets: Vec<LogPosition> = self
            .partitions
            .iter()
            .map(|m| LogPosition::new(m.partition(), m.offset + 1))
            .collect();
        counter!(CHECKPOINT_COMMITS_ENQUEUED).increment(1);
        match client.commit_offsets(group_id, &offsets).await {
            Ok(()) => debug!(
                group_id,
                partitions = offsets.len(),
                "committed checkpointed offsets to consumer group"
            ),
            Err(e) => warn!(
                group_id,
                error = %e,
                "best-effort consumer-group commit of checkpointed offsets failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn mark(topic: &str, partition: i32, offset: i64, ts_millis: Option<i64>) -> PartitionMark {
        PartitionMark {
            topic: topic.to_string(),
            partition,
            offset,
            timestamp: ts_millis.map(|ms| Utc.timestamp_millis_opt(ms).unwrap()),
        }
    }

    #[test]
    fn encode_decode_round_trips_structurally() {
        let original = CheckpointMark::new(vec![
            mark("topic_b", 1, 17, Some(17)),
            mark("topic_a", 0, -1, None),
            mark("topic_a", 3, 1024, Some(99)),
        ]);
        let decoded = CheckpointMark::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn entries_are_ordered_regardless_of_construction_order() {
        let a = CheckpointMark::new(vec![mark("t", 2, 5, None), mark("t", 0, 3, None)]);
        let b = CheckpointMark::new(vec![mark("t", 0, 3, None), mark("t", 2, 5, None)]);
        assert_eq!(a, b);
        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
    }

    #[test]
    fn decode_rejects_malformed_input() {
        let err = CheckpointMark::decode(b"{not json").unwrap_err();
        assert!(matches!(err, ReadError::Decode(_)));
    }

    #[test]
    fn mark_for_finds_covered_partitions_only() {
        let snapshot = CheckpointMark::new(vec![mark("events", 0, 10, None)]);
        assert_eq!(
            snapshot.mark_for(&Partition::new("events", 0)).map(|m| m.offset),
            Some(10)
        );
        assert!(snapshot.mark_for(&Partition::new("events", 1)).is_none());
    }
}
