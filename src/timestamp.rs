//! Per-partition event-time policies.
//!
//! A policy computes each record's event timestamp and the partition's
//! watermark from its own accumulated state. Watermarks must never regress
//! for a partition's lifetime; the cursor additionally clamps whatever a
//! policy reports so a misbehaving policy can only degrade watermark quality,
//! never read correctness.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::types::{Record, TimestampType};

/// Watermark reported for a partition that has not delivered a record yet.
pub const WATERMARK_UNKNOWN: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

/// Watermark reported once a bounded partition has been read to its end.
pub const WATERMARK_MAX: DateTime<Utc> = DateTime::<Utc>::MAX_UTC;

/// Accumulated per-partition facts handed to the policy on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionContext {
    /// Records between the current read position and the partition's last
    /// known end offset, when an end offset has been observed.
    pub backlog: Option<i64>,
}

impl PartitionContext {
    /// True once the read position has caught up with the last known end
    /// offset of the partition.
    pub fn caught_up(&self) -> bool {
        self.backlog == Some(0)
    }
}

/// Extracts an event timestamp from a record.
pub type TimestampExtractor = Arc<dyn Fn(&Record) -> DateTime<Utc> + Send + Sync>;

/// Per-partition timestamp and watermark logic. One instance per cursor,
/// mutated only by the owning reader.
pub trait TimestampPolicy: Send {
    /// The event timestamp for `record`. Conventionally non-decreasing;
    /// violations degrade only the watermark.
    fn timestamp_for(&mut self, ctx: &PartitionContext, record: &Record) -> DateTime<Utc>;

    /// A lower bound on future event timestamps for this partition.
    fn watermark(&mut self, ctx: &PartitionContext) -> DateTime<Utc>;
}

/// Selects a policy variant at configuration time; one policy instance is
/// created per partition when the reader starts.
#[derive(Clone)]
pub enum TimestampPolicyFactory {
    /// Wall-clock arrival time; the watermark tracks the wall clock.
    ProcessingTime,
    /// The broker's log-append timestamp; the watermark is the last such
    /// timestamp seen, which the broker guarantees is non-decreasing.
    LogAppendTime,
    /// A caller-supplied extractor; the watermark is the last extracted
    /// timestamp.
    Custom(TimestampExtractor),
    /// Like `Custom`, but reports [`WATERMARK_MAX`] once the partition's end
    /// offset is reached, letting bounded-replay consumers close out.
    EndOfSourceAware(TimestampExtractor),
}

impl TimestampPolicyFactory {
    /// Build the per-partition policy instance. `previous_watermark` carries
    /// the watermark a restored checkpoint recorded for this partition so the
    /// merged watermark does not regress across restarts.
    pub fn create(&self, previous_watermark: Option<DateTime<Utc>>) -> Box<dyn TimestampPolicy> {
        let floor = previous_watermark.unwrap_or(WATERMARK_UNKNOWN);
        match self {
            TimestampPolicyFactory::ProcessingTime => Box::new(ProcessingTimePolicy),
            TimestampPolicyFactory::LogAppendTime => Box::new(LogAppendTimePolicy { last: floor }),
            TimestampPolicyFactory::Custom(extract) => Box::new(CustomTimestampPolicy {
                extract: extract.clone(),
                last: floor,
                end_of_source_aware: false,
            }),
            TimestampPolicyFactory::EndOfSourceAware(extract) => Box::new(CustomTimestampPolicy {
                extract: extract.clone(),
                last: floor,
                end_of_source_aware: true,
            }),
        }
    }
}

impl fmt::Debug for TimestampPolicyFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimestampPolicyFactory::ProcessingTime => "ProcessingTime",
            TimestampPolicyFactory::LogAppendTime => "LogAppendTime",
            TimestampPolicyFactory::Custom(_) => "Custom",
            TimestampPolicyFactory::EndOfSourceAware(_) => "EndOfSourceAware",
        };
        f.write_str(name)
    }
}

struct ProcessingTimePolicy;

impl TimestampPolicy for ProcessingTimePolicy {
    fn timestamp_for(&mut self, _ctx: &PartitionContext, _record: &Record) -> DateTime<Utc> {
        Utc::now()
    }

    fn watermark(&mut self, _ctx: &PartitionContext) -> DateTime<Utc> {
        Utc::now()
    }
}

struct LogAppendTimePolicy {
    last: DateTime<Utc>,
}

impl TimestampPolicy for LogAppendTimePolicy {
    fn timestamp_for(&mut self, _ctx: &PartitionContext, record: &Record) -> DateTime<Utc> {
        match (record.timestamp_type(), record.timestamp()) {
            (TimestampType::LogAppendTime, Some(ts)) => {
                self.last = ts;
                ts
            }
            _ => {
                // The topic is not configured for log-append time. Reuse the
                // last known timestamp rather than inventing one.
                tracing::warn!(
                    topic = record.partition().topic(),
                    partition = record.partition().partition_number(),
                    offset = record.offset(),
                    "record carries no log-append timestamp"
                );
                self.last
            }
        }
    }

    fn watermark(&mut self, _ctx: &PartitionContext) -> DateTime<Utc> {
        self.last
    }
}

struct CustomTimestampPolicy {
    extract: TimestampExtractor,
    last: DateTime<Utc>,
    end_of_source_aware: bool,
}

impl TimestampPolicy for CustomTimestampPolicy {
    fn timestamp_for(&mut self, _ctx: &PartitionContext, record: &Record) -> DateTime<Utc> {
        let ts = (self.extract)(record);
        if ts > self.last {
            self.last = ts;
        }
        ts
    }

    fn watermark(&mut self, ctx: &PartitionContext) -> DateTime<Utc> {
        if self.end_of_source_aware && ctx.caught_up() {
            WATERMARK_MAX
        } else {
            self.last
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Partition;
    use bytes::Bytes;
    use chrono::TimeZone;

    fn record_at(offset: i64, ts: Option<DateTime<Utc>>, tt: TimestampType) -> Record {
        Record::new(
            Partition::new("t", 0),
            offset,
            None,
            Some(Bytes::from_static(b"v")),
            ts,
            tt,
        )
    }

    fn millis(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn log_append_time_watermark_tracks_last_broker_timestamp() {
        let mut policy = TimestampPolicyFactory::LogAppendTime.create(None);
        let ctx = PartitionContext::default();
        assert_eq!(policy.watermark(&ctx), WATERMARK_UNKNOWN);

        let ts = policy.timestamp_for(&ctx, &record_at(0, Some(millis(100)), TimestampType::LogAppendTime));
        assert_eq!(ts, millis(100));
        assert_eq!(policy.watermark(&ctx), millis(100));
    }

    #[test]
    fn log_append_time_falls_back_to_last_timestamp() {
        let mut policy = TimestampPolicyFactory::LogAppendTime.create(None);
        let ctx = PartitionContext::default();
        policy.timestamp_for(&ctx, &record_at(0, Some(millis(50)), TimestampType::LogAppendTime));
        let ts = policy.timestamp_for(&ctx, &record_at(1, None, TimestampType::NotAvailable));
        assert_eq!(ts, millis(50));
    }

    #[test]
    fn custom_policy_watermark_never_regresses() {
        let extract: TimestampExtractor =
            Arc::new(|r: &Record| r.timestamp().unwrap_or(WATERMARK_UNKNOWN));
        let mut policy = TimestampPolicyFactory::Custom(extract).create(None);
        let ctx = PartitionContext::default();

        policy.timestamp_for(&ctx, &record_at(0, Some(millis(200)), TimestampType::CreateTime));
        // An out-of-order record moves the timestamp back, not the watermark.
        let ts = policy.timestamp_for(&ctx, &record_at(1, Some(millis(120)), TimestampType::CreateTime));
        assert_eq!(ts, millis(120));
        assert_eq!(policy.watermark(&ctx), millis(200));
    }

    #[test]
    fn end_of_source_reports_max_watermark_when_caught_up() {
        let extract: TimestampExtractor =
            Arc::new(|r: &Record| r.timestamp().unwrap_or(WATERMARK_UNKNOWN));
        let mut policy = TimestampPolicyFactory::EndOfSourceAware(extract).create(None);

        let behind = PartitionContext { backlog: Some(3) };
        policy.timestamp_for(&behind, &record_at(0, Some(millis(10)), TimestampType::CreateTime));
        assert_eq!(policy.watermark(&behind), millis(10));

        let caught_up = PartitionContext { backlog: Some(0) };
        assert_eq!(policy.watermark(&caught_up), WATERMARK_MAX);
    }

    #[test]
    fn restored_watermark_seeds_the_policy_floor() {
        let mut policy = TimestampPolicyFactory::LogAppendTime.create(Some(millis(500)));
        let ctx = PartitionContext::default();
        assert_eq!(policy.watermark(&ctx), millis(500));
    }
}
