use thiserror::Error;

use crate::types::Partition;

/// Broker client failures, split by whether the fetch layer may retry them.
///
/// Transient errors are retried inside the reader with bounded backoff;
/// everything else is fatal and propagated.
#[derive(Error, Debug)]
pub enum ClientError {
    /// A recoverable broker error (timeout, transport hiccup, coordinator
    /// move). Safe to retry.
    #[error("transient broker error: {0}")]
    Transient(String),

    /// The partition does not exist on the broker.
    #[error("partition {partition} not found")]
    PartitionNotFound { partition: Partition },

    /// The client is not authorized for the topic or group.
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// The client was closed; no further operations are possible.
    #[error("client closed")]
    Closed,

    /// Any other broker error. Treated as fatal.
    #[error("broker error: {0}")]
    Other(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient(_))
    }
}

/// Failures surfaced by the partitioned reader.
#[derive(Error, Debug)]
pub enum ReadError {
    /// A partition failed to complete its initial seek within the configured
    /// bound. Fatal: skipping the partition would silently lose its data.
    #[error("partition {partition} did not complete seek within {timeout_ms}ms")]
    InitializationTimeout {
        partition: Partition,
        timeout_ms: u64,
    },

    /// A non-retriable failure on one partition (not found, authorization).
    #[error("permanent failure on partition {partition}")]
    PermanentPartition {
        partition: Partition,
        #[source]
        source: ClientError,
    },

    /// The checkpoint mark could not be decoded or does not cover the
    /// assignment. Fatal: a start position is never guessed.
    #[error("malformed checkpoint mark: {0}")]
    Decode(String),

    /// The checkpoint mark could not be serialized.
    #[error("checkpoint mark could not be encoded: {0}")]
    Encode(String),

    /// A start-read policy that cannot be applied to the assignment.
    #[error("invalid start position: {0}")]
    InvalidStartPosition(String),

    /// `advance()` or another read operation was called before `start()`
    /// returned successfully.
    #[error("reader has not been started")]
    NotStarted,

    /// The reader was closed.
    #[error("reader is closed")]
    Closed,

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl ReadError {
    /// Map a fatal client error observed on a known partition.
    pub(crate) fn permanent(partition: &Partition, source: ClientError) -> Self {
        match source {
            ClientError::PartitionNotFound { partition } => {
                let source = ClientError::PartitionNotFound {
                    partition: partition.clone(),
                };
                ReadError::PermanentPartition { partition, source }
            }
            other => ReadError::PermanentPartition {
                partition: partition.clone(),
                source: other,
            },
        }
    }
}

/// Failures surfaced by the exactly-once sink.
#[derive(Error, Debug)]
pub enum SinkError {
    /// A record failed to reach the broker. In at-least-once mode the first
    /// send error is captured and re-raised on the next call; it is never
    /// swallowed.
    #[error("send failed on shard {shard}: {reason}")]
    Send { shard: usize, reason: String },

    /// The transaction could not commit (producer fenced, epoch conflict).
    /// The bundle must be redriven as a whole.
    #[error("commit conflict on shard {shard}: {reason}")]
    CommitConflict { shard: usize, reason: String },

    /// The sink was closed.
    #[error("sink is closed")]
    Closed,

    /// Any other writer-side failure.
    #[error("writer error: {0}")]
    Writer(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_the_only_retriable_client_error() {
        assert!(ClientError::Transient("timeout".into()).is_transient());
        assert!(!ClientError::Other("boom".into()).is_transient());
        assert!(!ClientError::Closed.is_transient());
        assert!(!ClientError::Authorization("denied".into()).is_transient());
    }

    #[test]
    fn permanent_mapping_prefers_the_partition_from_the_error() {
        let observed = Partition::new("events", 1);
        let missing = Partition::new("events", 7);
        let err = ReadError::permanent(
            &observed,
            ClientError::PartitionNotFound {
                partition: missing.clone(),
            },
        );
        match err {
            ReadError::PermanentPartition { partition, .. } => assert_eq!(partition, missing),
            other => panic!("unexpected error: {other}"),
        }
    }
}
