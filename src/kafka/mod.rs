//! rdkafka-backed implementations of the broker contracts.
//!
//! [`KafkaPartitionClient`] adapts a `BaseConsumer` to [`crate::client::PartitionClient`];
//! [`KafkaTransactionalWriter`] adapts a transactional `FutureProducer` to
//! [`crate::client::TransactionalWriter`].

mod client;
mod writer;

pub use client::KafkaPartitionClient;
pub use writer::KafkaTransactionalWriter;

use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;

use crate::error::ClientError;
use crate::types::Partition;

/// Map an rdkafka error onto the retry taxonomy the fetch layer understands.
/// `partition` is the partition the failed call was about, when known.
pub(crate) fn classify(err: KafkaError, partition: Option<&Partition>) -> ClientError {
    use RDKafkaErrorCode::*;
    match err.rdkafka_error_code() {
        Some(UnknownTopicOrPartition) | Some(UnknownPartition) | Some(UnknownTopic) => {
            match partition {
                Some(partition) => ClientError::PartitionNotFound {
                    partition: partition.clone(),
                },
                None => ClientError::Other(err.to_string()),
            }
        }
        Some(TopicAuthorizationFailed)
        | Some(GroupAuthorizationFailed)
        | Some(ClusterAuthorizationFailed)
        | Some(SaslAuthenticationFailed) => ClientError::Authorization(err.to_string()),
        Some(OperationTimedOut)
        | Some(RequestTimedOut)
        | Some(BrokerTransportFailure)
        | Some(AllBrokersDown)
        | Some(NotCoordinator)
        | Some(CoordinatorLoadInProgress)
        | Some(CoordinatorNotAvailable)
        | Some(LeaderNotAvailable)
        | Some(NotLeaderForPartition)
        | Some(NetworkException) => ClientError::Transient(err.to_string()),
        _ => ClientError::Other(err.to_string()),
    }
}
