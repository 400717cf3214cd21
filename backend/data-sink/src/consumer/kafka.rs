//! Kafka consumer with manual offset commits
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::Offset;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::RecordSource;
use crate::checkpoint::OffsetStore;
use crate::error::{Result, SinkError};
use crate::model::Record;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Consumer settings for one forwarder instance
#[derive(Debug, Clone)]
pub struct KafkaConsumerConfig {
    pub brokers: String,
    pub group_id: String,
    pub topic: String,
    pub client_id: String,
}

/// Create a consumer subscribed to the configured topic.
///
/// Auto-commit is disabled; offsets are committed through [`KafkaOffsetStore`]
/// only after documents are written.
pub fn create_consumer(config: &KafkaConsumerConfig) -> Result<Arc<StreamConsumer>> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("group.id", &config.group_id)
        .set("bootstrap.servers", &config.brokers)
        .set("client.id", &config.client_id)
        .set("enable.auto.commit", "false") // Manual commit after write
        .set("auto.offset.reset", "earliest") // Start from beginning if no offset
        .set("session.timeout.ms", "30000")
        .set("heartbeat.interval.ms", "3000")
        .set("max.poll.interval.ms", "300000") // 5 minutes
        .set("enable.partition.eof", "false")
        .create()
        .map_err(|e| {
            error!("Failed to create Kafka consumer: {}", e);
            SinkError::Config(format!("Kafka consumer: {}", e))
        })?;

    consumer.subscribe(&[config.topic.as_str()]).map_err(|e| {
        error!("Failed to subscribe to topic {}: {}", config.topic, e);
        classify(e)
    })?;

    info!(
        topic = %config.topic,
        group_id = %config.group_id,
        client_id = %config.client_id,
        "Kafka consumer subscribed"
    );

    Ok(Arc::new(consumer))
}

fn is_fatal_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
            | RDKafkaErrorCode::Fatal
    )
}

/// Authentication and authorization failures halt the forwarder; everything else is retried
fn classify(err: KafkaError) -> SinkError {
    match err.rdkafka_error_code() {
        Some(code) if is_fatal_code(code) => SinkError::FatalConfig(err.to_string()),
        _ => SinkError::TransientConnection(err.to_string()),
    }
}

fn to_record<M: Message>(msg: &M) -> Record {
    Record {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(<[u8]>::to_vec),
        value: msg.payload().map(<[u8]>::to_vec),
        timestamp: msg.timestamp().to_millis(),
    }
}

/// [`RecordSource`] over an rdkafka [`StreamConsumer`]
pub struct KafkaRecordSource {
    consumer: Arc<StreamConsumer>,
    /// Error that arrived after records were already collected; reported by the next poll
    deferred: Mutex<Option<SinkError>>,
}

impl KafkaRecordSource {
    pub fn new(consumer: Arc<StreamConsumer>) -> Self {
        Self {
            consumer,
            deferred: Mutex::new(None),
        }
    }

    fn defer(&self, err: SinkError) {
        *self
            .deferred
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(err);
    }

    fn take_deferred(&self) -> Option<SinkError> {
        self.deferred
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[async_trait]
impl RecordSource for KafkaRecordSource {
    async fn poll(&self, max_batch_size: usize, timeout: Duration) -> Result<Vec<Record>> {
        if let Some(err) = self.take_deferred() {
            return Err(err);
        }

        let deadline = Instant::now() + timeout;
        let mut records = Vec::with_capacity(max_batch_size.min(1024));

        while records.len() < max_batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());

            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(msg)) => records.push(to_record(&msg)),
                Ok(Err(e)) if records.is_empty() => return Err(classify(e)),
                Ok(Err(e)) => {
                    // Hand back what we have and report the error on the next poll
                    warn!(error = %e, received = records.len(), "Kafka error mid-batch");
                    self.defer(classify(e));
                    break;
                }
            }

            if remaining.is_zero() {
                break;
            }
        }

        if !records.is_empty() {
            debug!(count = records.len(), "Polled records from Kafka");
        }

        Ok(records)
    }
}

/// Refuse a commit unless `partition` is still assigned to this consumer and
/// the group has not already committed past `offset`.
fn check_ownership(
    topic: &str,
    partition: i32,
    offset: i64,
    assignment: &TopicPartitionList,
    committed: &TopicPartitionList,
) -> Result<()> {
    if assignment.find_partition(topic, partition).is_none() {
        return Err(SinkError::PartitionRevoked { partition });
    }

    // Another owner made progress while we held the partition's last batch
    if let Some(Offset::Offset(next)) = committed
        .find_partition(topic, partition)
        .map(|elem| elem.offset())
    {
        if next > offset + 1 {
            return Err(SinkError::PartitionRevoked { partition });
        }
    }

    Ok(())
}

/// Consumer-group offsets of one topic.
///
/// Kafka stores the next offset to read, so `persist(p, o)` commits `o + 1`
/// and [`OffsetStore::committed`] reports `committed - 1`. Commits are
/// synchronous: `persist` returns only once the coordinator accepted it.
pub struct KafkaOffsetStore {
    consumer: Arc<StreamConsumer>,
    topic: String,
}

impl KafkaOffsetStore {
    pub fn new(consumer: Arc<StreamConsumer>, topic: impl Into<String>) -> Self {
        Self {
            consumer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl OffsetStore for KafkaOffsetStore {
    async fn persist(&self, partition: i32, offset: i64) -> Result<()> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();

        // Ownership lookups and the commit itself block on the group coordinator
        let commit = tokio::task::spawn_blocking(move || -> Result<()> {
            let assignment = consumer.assignment().map_err(classify)?;

            let mut lookup = TopicPartitionList::new();
            lookup.add_partition(&topic, partition);
            let committed = consumer
                .committed_offsets(lookup, METADATA_TIMEOUT)
                .map_err(classify)?;

            check_ownership(&topic, partition, offset, &assignment, &committed)?;

            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(&topic, partition, Offset::Offset(offset + 1))
                .map_err(classify)?;
            consumer.commit(&tpl, CommitMode::Sync).map_err(classify)
        });

        commit
            .await
            .map_err(|e| SinkError::TransientConnection(format!("Offset commit task failed: {}", e)))?
            .map_err(|e| {
                if !matches!(e, SinkError::PartitionRevoked { .. }) {
                    error!("Failed to commit Kafka offset: {}", e);
                }
                e
            })?;

        debug!(
            "Committed offset: topic={}, partition={}, offset={}",
            self.topic,
            partition,
            offset + 1
        );

        Ok(())
    }

    async fn committed(&self) -> Result<BTreeMap<i32, i64>> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();

        // Metadata and committed-offset lookups block on the broker
        let lookup = tokio::task::spawn_blocking(move || -> Result<BTreeMap<i32, i64>> {
            let metadata = consumer
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map_err(classify)?;

            let mut tpl = TopicPartitionList::new();
            for partition in metadata
                .topics()
                .iter()
                .filter(|t| t.name() == topic)
                .flat_map(|t| t.partitions())
            {
                tpl.add_partition(&topic, partition.id());
            }

            if tpl.count() == 0 {
                info!(topic = %topic, "No partitions found, starting without checkpoints");
                return Ok(BTreeMap::new());
            }

            let committed = consumer
                .committed_offsets(tpl, METADATA_TIMEOUT)
                .map_err(classify)?;

            let offsets: BTreeMap<i32, i64> = committed
                .elements_for_topic(&topic)
                .iter()
                .filter_map(|elem| match elem.offset() {
                    Offset::Offset(next) if next > 0 => Some((elem.partition(), next - 1)),
                    _ => None,
                })
                .collect();

            Ok(offsets)
        });

        lookup
            .await
            .map_err(|e| SinkError::TransientConnection(format!("Offset lookup task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::OwnedMessage;
    use rdkafka::Timestamp;

    #[test]
    fn test_auth_errors_are_fatal() {
        let err = classify(KafkaError::MessageConsumption(
            RDKafkaErrorCode::TopicAuthorizationFailed,
        ));
        assert!(matches!(err, SinkError::FatalConfig(_)));

        let err = classify(KafkaError::MessageConsumption(
            RDKafkaErrorCode::SaslAuthenticationFailed,
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_broker_errors_are_transient() {
        let err = classify(KafkaError::MessageConsumption(
            RDKafkaErrorCode::BrokerTransportFailure,
        ));
        assert!(matches!(err, SinkError::TransientConnection(_)));

        let err = classify(KafkaError::MessageConsumption(
            RDKafkaErrorCode::AllBrokersDown,
        ));
        assert!(err.is_transient());
    }

    #[test]
    fn test_message_to_record() {
        let msg = OwnedMessage::new(
            Some(br#"{"id":1}"#.to_vec()),
            Some(b"k1".to_vec()),
            "orders".to_string(),
            Timestamp::CreateTime(1_700_000_000_000),
            2,
            41,
            None,
        );

        let record = to_record(&msg);
        assert_eq!(record.topic, "orders");
        assert_eq!(record.partition, 2);
        assert_eq!(record.offset, 41);
        assert_eq!(record.key.as_deref(), Some(&b"k1"[..]));
        assert_eq!(record.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn test_tombstone_has_no_value() {
        let msg = OwnedMessage::new(
            None,
            None,
            "orders".to_string(),
            Timestamp::NotAvailable,
            0,
            7,
            None,
        );

        let record = to_record(&msg);
        assert!(record.value.is_none());
        assert!(record.timestamp.is_none());
    }

    fn tpl(entries: &[(i32, Offset)]) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in entries {
            tpl.add_partition_offset("orders", *partition, *offset).unwrap();
        }
        tpl
    }

    #[test]
    fn test_commit_refused_for_unassigned_partition() {
        let assignment = tpl(&[(0, Offset::Invalid)]);
        let committed = tpl(&[(1, Offset::Offset(5))]);

        let err = check_ownership("orders", 1, 10, &assignment, &committed).unwrap_err();
        assert!(matches!(err, SinkError::PartitionRevoked { partition: 1 }));
    }

    #[test]
    fn test_commit_refused_when_group_moved_past() {
        let assignment = tpl(&[(0, Offset::Invalid)]);
        let committed = tpl(&[(0, Offset::Offset(50))]);

        // 50 is the next offset to read, so 49 was the last handled record
        let err = check_ownership("orders", 0, 30, &assignment, &committed).unwrap_err();
        assert!(matches!(err, SinkError::PartitionRevoked { partition: 0 }));

        assert!(check_ownership("orders", 0, 49, &assignment, &committed).is_ok());
        assert!(check_ownership("orders", 0, 60, &assignment, &committed).is_ok());
    }

    #[test]
    fn test_commit_allowed_without_group_offset() {
        let assignment = tpl(&[(0, Offset::Invalid)]);
        let committed = tpl(&[(0, Offset::Invalid)]);

        assert!(check_ownership("orders", 0, 0, &assignment, &committed).is_ok());
    }

    #[tokio::test]
    async fn test_mid_batch_error_reported_by_next_poll() {
        let consumer = create_consumer(&KafkaConsumerConfig {
            brokers: "localhost:9092".to_string(),
            group_id: "data-sink-test".to_string(),
            topic: "orders".to_string(),
            client_id: "data-sink-test".to_string(),
        })
        .unwrap();
        let source = KafkaRecordSource::new(consumer);

        source.defer(classify(KafkaError::MessageConsumption(
            RDKafkaErrorCode::TopicAuthorizationFailed,
        )));

        let err = source.poll(10, Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(source.take_deferred().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires Kafka at KAFKA_BROKER_URL
    async fn test_poll_times_out_empty() {
        let brokers =
            std::env::var("KAFKA_BROKER_URL").unwrap_or_else(|_| "localhost:9092".to_string());
        let consumer = create_consumer(&KafkaConsumerConfig {
            brokers,
            group_id: "data-sink-test".to_string(),
            topic: "data-sink-empty-topic".to_string(),
            client_id: "data-sink-test".to_string(),
        })
        .unwrap();

        let source = KafkaRecordSource::new(consumer);
        let records = source.poll(10, Duration::from_millis(500)).await.unwrap();
        assert!(records.is_empty());
    }
}
