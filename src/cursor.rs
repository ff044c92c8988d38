//! Read state for a single assigned partition.
//!
//! A cursor is created when the reader starts, mutated only by the owning
//! reader's foreground loop, and dropped on close. The background fetcher
//! never touches cursor fields; it feeds the bounded record queue and keeps
//! the shared end-offset estimate fresh, which is all a checkpoint needs to
//! stay a quiescent-point read.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::timestamp::{PartitionContext, TimestampPolicy, WATERMARK_UNKNOWN};
use crate::types::{Partition, Record};

/// End-offset estimate shared between the background fetcher (writer) and
/// the cursor (reader). `-1` until the first successful bound fetch.
pub(crate) struct PartitionProgress {
    end_offset: AtomicI64,
}

impl PartitionProgress {
    pub(crate) fn new() -> Self {
        Self {
            end_offset: AtomicI64::new(-1),
        }
    }

    pub(crate) fn set_end_offset(&self, end: i64) {
        // End offsets only move forward; a stale broker answer must not
        // shrink the backlog estimate.
        self.end_offset.fetch_max(end, Ordering::Relaxed);
    }

    pub(crate) fn end_offset(&self) -> Option<i64> {
        let end = self.end_offset.load(Ordering::Relaxed);
        (end >= 0).then_some(end)
    }
}

pub(crate) struct PartitionCursor {
    partition: Partition,
    start_offset: i64,
    /// The next offset this cursor expects to deliver. Only increases.
    next_offset: i64,
    last_delivered_timestamp: Option<DateTime<Utc>>,
    policy: Box<dyn TimestampPolicy>,
    /// Monotone clamp over whatever the policy reports.
    last_watermark: DateTime<Utc>,
    /// Running average delivered record size, for backlog-bytes estimates.
    avg_record_bytes: f64,
    progress: Arc<PartitionProgress>,
    queue: mpsc::Receiver<Record>,
}

impl PartitionCursor {
    pub(crate) fn new(
        partition: Partition,
        start_offset: i64,
        policy: Box<dyn TimestampPolicy>,
        progress: Arc<PartitionProgress>,
        queue: mpsc::Receiver<Record>,
    ) -> Self {
        Self {
            partition,
            start_offset,
            next_offset: start_offset,
            last_delivered_timestamp: None,
            policy,
            last_watermark: WATERMARK_UNKNOWN,
            avg_record_bytes: 0.0,
            progress,
            queue,
        }
    }

    pub(crate) fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Non-blocking: deliver the next buffered record, if any, stamping it
    /// with the policy's event timestamp and advancing the read position.
    pub(crate) fn try_next(&mut self) -> Option<(Record, DateTime<Utc>)> {
        loop {
            let record = self.queue.try_recv().ok()?;
            // A fetch retry after a partial batch can replay records the
            // cursor already delivered; they are filtered here so a record
            // is emitted at most once between checkpoints.
            if record.offset() < self.next_offset {
                continue;
            }
            let ctx = self.context();
            let ts = self.policy.timestamp_for(&ctx, &record);
            self.next_offset = record.offset() + 1;
            self.last_delivered_timestamp = Some(ts);
            let size = record.size_bytes() as f64;
            self.avg_record_bytes = if self.avg_record_bytes == 0.0 {
                size
            } else {
                0.95 * self.avg_record_bytes + 0.05 * size
            };
            return Some((record, ts));
        }
    }

    /// Unread records relative to the last known end offset, when known.
    pub(crate) fn backlog(&self) -> Option<i64> {
        self.progress
            .end_offset()
            .map(|end| (end - self.next_offset).max(0))
    }

    pub(crate) fn backlog_bytes(&self) -> Option<i64> {
        self.backlog()
            .map(|records| (records as f64 * self.avg_record_bytes) as i64)
    }

    /// The partition watermark, clamped so it never regresses even if the
    /// policy misbehaves or the partition goes idle.
    pub(crate) fn watermark(&mut self) -> DateTime<Utc> {
        let ctx = self.context();
        let reported = self.policy.watermark(&ctx);
        if reported > self.last_watermark {
            self.last_watermark = reported;
        }
        self.last_watermark
    }

    /// The offset a checkpoint records for this partition: the last delivered
    /// offset, or `start - 1` when nothing has been delivered yet. Resuming
    /// at `offset + 1` is correct in both cases.
    pub(crate) fn checkpoint_offset(&self) -> i64 {
        self.next_offset - 1
    }

    pub(crate) fn last_delivered_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_delivered_timestamp
    }

    fn context(&self) -> PartitionContext {
        PartitionContext {
            backlog: self.backlog(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::{TimestampExtractor, TimestampPolicyFactory, WATERMARK_MAX};
    use crate::types::TimestampType;
    use bytes::Bytes;
    use chrono::TimeZone;

    fn value_extractor() -> TimestampExtractor {
        Arc::new(|r: &Record| r.timestamp().unwrap_or(WATERMARK_UNKNOWN))
    }

    fn record(partition: &Partition, offset: i64) -> Record {
        Record::new(
            partition.clone(),
            offset,
            None,
            Some(Bytes::from_static(b"payload")),
            Some(Utc.timestamp_millis_opt(offset).unwrap()),
            TimestampType::CreateTime,
        )
    }

    fn cursor_with_queue(
        start_offset: i64,
        capacity: usize,
    ) -> (PartitionCursor, mpsc::Sender<Record>, Arc<PartitionProgress>) {
        let partition = Partition::new("t", 0);
        let progress = Arc::new(PartitionProgress::new());
        let (tx, rx) = mpsc::channel(capacity);
        let policy = TimestampPolicyFactory::EndOfSourceAware(value_extractor()).create(None);
        let cursor = PartitionCursor::new(partition, start_offset, policy, progress.clone(), rx);
        (cursor, tx, progress)
    }

    #[tokio::test]
    async fn delivers_buffered_records_and_advances() {
        let (mut cursor, tx, _) = cursor_with_queue(0, 8);
        let partition = cursor.partition().clone();
        tx.try_send(record(&partition, 0)).unwrap();
        tx.try_send(record(&partition, 1)).unwrap();

        let (first, _) = cursor.try_next().unwrap();
        assert_eq!(first.offset(), 0);
        let (second, _) = cursor.try_next().unwrap();
        assert_eq!(second.offset(), 1);
        assert!(cursor.try_next().is_none());
        assert_eq!(cursor.checkpoint_offset(), 1);
    }

    #[tokio::test]
    async fn filters_replayed_records_below_read_position() {
        let (mut cursor, tx, _) = cursor_with_queue(0, 8);
        let partition = cursor.partition().clone();
        tx.try_send(record(&partition, 0)).unwrap();
        tx.try_send(record(&partition, 0)).unwrap();
        tx.try_send(record(&partition, 1)).unwrap();

        assert_eq!(cursor.try_next().unwrap().0.offset(), 0);
        assert_eq!(cursor.try_next().unwrap().0.offset(), 1);
        assert!(cursor.try_next().is_none());
    }

    #[tokio::test]
    async fn checkpoint_offset_before_any_delivery_points_at_start_minus_one() {
        let (cursor, _tx, _) = cursor_with_queue(42, 8);
        assert_eq!(cursor.checkpoint_offset(), 41);
    }

    #[tokio::test]
    async fn backlog_tracks_end_offset_and_drives_end_of_source_watermark() {
        let (mut cursor, tx, progress) = cursor_with_queue(0, 8);
        let partition = cursor.partition().clone();
        assert_eq!(cursor.backlog(), None);
        assert_eq!(cursor.watermark(), WATERMARK_UNKNOWN);

        progress.set_end_offset(2);
        tx.try_send(record(&partition, 0)).unwrap();
        tx.try_send(record(&partition, 1)).unwrap();

        cursor.try_next().unwrap();
        assert_eq!(cursor.backlog(), Some(1));
        assert_eq!(cursor.watermark(), Utc.timestamp_millis_opt(0).unwrap());

        cursor.try_next().unwrap();
        assert_eq!(cursor.backlog(), Some(0));
        assert_eq!(cursor.watermark(), WATERMARK_MAX);
    }

    #[tokio::test]
    async fn stale_end_offset_does_not_shrink_backlog() {
        let progress = PartitionProgress::new();
        progress.set_end_offset(10);
        progress.set_end_offset(4);
        assert_eq!(progress.end_offset(), Some(10));
    }
}
