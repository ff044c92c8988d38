use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::consumer::ConsumerGroupMetadata;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, error, info};

use super::classify;
use crate::client::{DeliveryFuture, TransactionalWriter};
use crate::config::BrokerConfig;
use crate::error::{ClientError, SinkError};
use crate::types::{LogPosition, SinkRecord};

/// One shard's transactional producer. The transactional id must be stable
/// across restarts for the same shard so the broker fences the previous
/// incarnation when the shard comes back.
pub struct KafkaTransactionalWriter {
    shard: usize,
    producer: FutureProducer,
    group_metadata: Option<ConsumerGroupMetadata>,
    timeout: Duration,
}

impl KafkaTransactionalWriter {
    pub fn from_config(
        config: &BrokerConfig,
        transactional_id: &str,
        shard: usize,
        group_metadata: Option<ConsumerGroupMetadata>,
    ) -> Result<Self, ClientError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.broker_hosts)
            .set("linger.ms", config.producer_linger_ms.to_string())
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("compression.codec", config.compression_codec.to_owned())
            .set("transactional.id", transactional_id);

        if config.broker_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        debug!("rdkafka producer configuration: {:?}", client_config);
        let producer: FutureProducer = client_config.create().map_err(|e| classify(e, None))?;

        // "Ping" the brokers by requesting metadata before committing to
        // this producer.
        match producer
            .client()
            .fetch_metadata(None, Duration::from_secs(15))
        {
            Ok(metadata) => {
                info!(
                    shard,
                    topics = metadata.topics().len(),
                    "connected to brokers"
                );
            }
            Err(e) => {
                error!(shard, error = %e, "failed to fetch metadata from brokers");
                return Err(classify(e, None));
            }
        }

        let timeout = config.operation_timeout();
        producer
            .init_transactions(timeout)
            .map_err(|e| classify(e, None))?;

        Ok(Self {
            shard,
            producer,
            group_metadata,
            timeout,
        })
    }
}

fn classify_sink(shard: usize, err: KafkaError) -> SinkError {
    use RDKafkaErrorCode::*;
    match err.rdkafka_error_code() {
        Some(Fenced)
        | Some(ProducerFenced)
        | Some(InvalidProducerEpoch)
        | Some(TransactionCoordinatorFenced) => SinkError::CommitConflict {
            shard,
            reason: err.to_string(),
        },
        _ => SinkError::Writer(err.to_string()),
    }
}

#[async_trait]
impl TransactionalWriter for KafkaTransactionalWriter {
    async fn begin_transaction(&mut self, epoch: u64) -> Result<(), SinkError> {
        debug!(shard = self.shard, epoch, "beginning transaction");
        self.producer
            .begin_transaction()
            .map_err(|e| classify_sink(self.shard, e))
    }

    async fn send(&mut self, record: SinkRecord) -> Result<DeliveryFuture, SinkError> {
        let shard = self.shard;
        let mut kafka_record =
            FutureRecord::<[u8], [u8]>::to(record.topic()).payload(record.payload().as_ref());
        if let Some(key) = record.shard_key() {
            kafka_record = kafka_record.key(key.as_ref());
        }
        if let Some(timestamp) = record.timestamp() {
            kafka_record = kafka_record.timestamp(timestamp.timestamp_millis());
        }
        match self.producer.send_result(kafka_record) {
            Ok(delivery) => Ok(async move {
                match delivery.await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err((e, _message))) => Err(e.to_string()),
                    Err(_canceled) => Err("delivery notification dropped".to_string()),
                }
            }
            .boxed()),
            Err((e, _record)) => Err(SinkError::Send {
                shard,
                reason: e.to_string(),
            }),
        }
    }

    async fn send_offsets(
        &mut self,
        _group_id: &str,
        offsets: &[LogPosition],
    ) -> Result<(), SinkError> {
        let metadata = self.group_metadata.as_ref().ok_or_else(|| {
            SinkError::Writer("no consumer group metadata for offset commit".into())
        })?;
        let mut tpl = TopicPartitionList::new();
        for position in offsets {
            tpl.add_partition_offset(
                position.topic(),
                position.partition_number(),
                Offset::Offset(position.offset()),
            )
            .map_err(|e| classify_sink(self.shard, e))?;
        }
        self.producer
            .send_offsets_to_transaction(&tpl, metadata, self.timeout)
            .map_err(|e| classify_sink(self.shard, e))
    }

    async fn commit_transaction(&mut self) -> Result<(), SinkError> {
        self.producer
            .commit_transaction(self.timeout)
            .map_err(|e| classify_sink(self.shard, e))
    }

    async fn abort_transaction(&mut self) -> Result<(), SinkError> {
        self.producer
            .abort_transaction(self.timeout)
            .map_err(|e| classify_sink(self.shard, e))
    }

    async fn close(&mut self) {
        let _ = self.producer.flush(self.timeout);
    }
}
