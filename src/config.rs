use std::time::Duration;

use envconfig::Envconfig;

use crate::sink::DeliveryMode;
use crate::timestamp::TimestampPolicyFactory;
use crate::types::{Partition, StartReadPolicy};

/// Broker connection settings shared by readers and sinks.
#[derive(Envconfig, Clone)]
pub struct BrokerConfig {
    #[envconfig(default = "localhost:9092")]
    pub broker_hosts: String,

    #[envconfig(default = "20")]
    pub producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "20000")]
    pub message_timeout_ms: u32, // Time before we stop retrying a produced message

    #[envconfig(default = "none")]
    pub compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub broker_tls: bool,

    #[envconfig(default = "10000")]
    pub operation_timeout_ms: u64, // Bound on individual broker calls (seek, bounds, commit)
}

impl BrokerConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Programmatic reader settings. Construct with [`ReaderOptions::new`] and
/// override the pieces that matter for the deployment.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Consumer group the reader reports progress under.
    pub group_id: String,
    /// Explicit partition assignment.
    pub partitions: Vec<Partition>,
    /// Where a reader without a checkpoint begins.
    pub start: StartReadPolicy,
    /// Event-time policy applied per partition.
    pub timestamp_policy: TimestampPolicyFactory,
    /// Buffered records per partition between the fetcher and the cursor.
    pub queue_capacity: usize,
    /// Cap on records pulled per broker poll.
    pub max_poll_records: usize,
    /// How long one broker poll may wait for data.
    pub poll_timeout: Duration,
    /// Bound on each partition's initial seek before the reader fails with
    /// an initialization timeout.
    pub start_timeout: Duration,
    /// How often the fetcher refreshes per-partition end offsets for the
    /// backlog estimate.
    pub end_offset_refresh_interval: Duration,
}

impl ReaderOptions {
    pub fn new(group_id: impl Into<String>, partitions: Vec<Partition>) -> Self {
        Self {
            group_id: group_id.into(),
            partitions,
            start: StartReadPolicy::Earliest,
            timestamp_policy: TimestampPolicyFactory::ProcessingTime,
            queue_capacity: 1024,
            max_poll_records: 500,
            poll_timeout: Duration::from_millis(100),
            start_timeout: Duration::from_secs(30),
            end_offset_refresh_interval: Duration::from_secs(1),
        }
    }

    pub fn with_start(mut self, start: StartReadPolicy) -> Self {
        self.start = start;
        self
    }

    pub fn with_timestamp_policy(mut self, policy: TimestampPolicyFactory) -> Self {
        self.timestamp_policy = policy;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}

/// Programmatic sink settings.
#[derive(Debug, Clone)]
pub struct SinkOptions {
    /// Consumer group whose offsets the sink advances inside transactions.
    pub group_id: String,
    /// Number of transactional writers records are routed across.
    pub num_shards: usize,
    /// Cap on unacknowledged sends per shard. Bounds memory and throttles
    /// upstream production; unbounded buffering is disallowed.
    pub max_in_flight: usize,
    pub mode: DeliveryMode,
}

impl SinkOptions {
    pub fn new(group_id: impl Into<String>, num_shards: usize) -> Self {
        Self {
            group_id: group_id.into(),
            num_shards: num_shards.max(1),
            max_in_flight: 1000,
            mode: DeliveryMode::ExactlyOnce,
        }
    }

    pub fn with_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_defaults_are_sane() {
        let options = ReaderOptions::new("group", vec![Partition::new("t", 0)]);
        assert!(matches!(options.start, StartReadPolicy::Earliest));
        assert!(options.queue_capacity > 0);
        assert!(options.start_timeout > Duration::ZERO);
    }

    #[test]
    fn sink_options_clamp_degenerate_values() {
        let options = SinkOptions::new("group", 0).with_max_in_flight(0);
        assert_eq!(options.num_shards, 1);
        assert_eq!(options.max_in_flight, 1);
    }
}
