//! 📡 Kafka, via librdkafka, via rdkafka. Turtles, but with partitions.
//!
//! The producer side is a `FutureProducer`: one `send`, one delivery report.
//! The consumer side is a `StreamConsumer` with manual partition assignment and
//! auto-commit switched off, because our offsets live in the checkpoint file and
//! nowhere else.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::{BrokerConfig, Publisher, Subscriber, TopicMessage};
use crate::errors::PipelineError;
use crate::workers::consumer_worker::StartPolicy;

/// ⏱️ Once a batch has its first message, how long we linger for stragglers.
const BATCH_LINGER: Duration = Duration::from_millis(10);

fn base_client_config(config: &BrokerConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.bootstrap_servers);
    for (key, value) in &config.client_properties {
        client.set(key, value);
    }
    client
}

/// 📤 Publishes to one topic, keyed, waiting for the delivery report every time.
pub(crate) struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl fmt::Debug for KafkaPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaPublisher")
            .field("topic", &self.topic)
            .field("send_timeout", &self.send_timeout)
            .finish_non_exhaustive()
    }
}

impl KafkaPublisher {
    /// 🏗️ Build the producer. No network yet, librdkafka connects lazily.
    pub(crate) fn new(config: &BrokerConfig, send_timeout: Duration) -> Result<Self> {
        let mut client = base_client_config(config);
        client.set("message.timeout.ms", send_timeout.as_millis().to_string());
        let producer: FutureProducer = client.create().with_context(|| {
            format!(
                "💀 Could not create a Kafka producer for '{}'. Check the bootstrap servers and client properties.",
                config.bootstrap_servers
            )
        })?;
        info!(
            "📡 Kafka producer ready: servers={}, topic={}",
            config.bootstrap_servers, config.topic
        );
        Ok(Self {
            producer,
            topic: config.topic.clone(),
            send_timeout,
        })
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&mut self, key: &str, payload: &[u8]) -> Result<(), PipelineError> {
        let record = FutureRecord::to(&self.topic).key(key).payload(payload);
        let delivery = tokio::time::timeout(
            self.send_timeout,
            self.producer.send(record, Timeout::After(self.send_timeout)),
        )
        .await;

        match delivery {
            Err(_elapsed) => Err(PipelineError::PublishTimeout(self.send_timeout)),
            Ok(Ok(_delivered)) => Ok(()),
            Ok(Err((err, _unsent))) => Err(classify_send_error(err, self.send_timeout)),
        }
    }
}

fn classify_send_error(err: KafkaError, send_timeout: Duration) -> PipelineError {
    match err {
        KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut)
        | KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull) => {
            PipelineError::PublishTimeout(send_timeout)
        }
        other => PipelineError::PublishFailure(other.to_string()),
    }
}

/// 📥 Reads one topic from explicitly assigned positions. No group rebalancing, no broker-side commits.
pub(crate) struct KafkaSubscriber {
    consumer: StreamConsumer,
    topic: String,
    metadata_timeout: Duration,
}

impl fmt::Debug for KafkaSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaSubscriber")
            .field("topic", &self.topic)
            .field("metadata_timeout", &self.metadata_timeout)
            .finish_non_exhaustive()
    }
}

impl KafkaSubscriber {
    pub(crate) fn new(config: &BrokerConfig, group_id: &str, policy: StartPolicy) -> Result<Self> {
        let mut client = base_client_config(config);
        client
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", auto_offset_reset(policy));
        let consumer: StreamConsumer = client.create().with_context(|| {
            format!(
                "💀 Could not create a Kafka consumer for '{}' in group '{group_id}'.",
                config.bootstrap_servers
            )
        })?;
        Ok(Self {
            consumer,
            topic: config.topic.clone(),
            metadata_timeout: config.metadata_timeout(),
        })
    }
}

fn auto_offset_reset(policy: StartPolicy) -> &'static str {
    match policy {
        StartPolicy::Earliest => "earliest",
        StartPolicy::Latest => "latest",
    }
}

fn fallback_offset(policy: StartPolicy) -> Offset {
    match policy {
        StartPolicy::Earliest => Offset::Beginning,
        StartPolicy::Latest => Offset::End,
    }
}

/// 💤 After a consumer error with nothing in hand, sit out the rest of the poll
/// wait, so a broker that keeps failing is retried at the poll rate.
fn error_pause(nothing_yet: bool, remaining: Duration) -> Duration {
    if nothing_yet { remaining } else { Duration::ZERO }
}

fn owned_message(message: &BorrowedMessage<'_>) -> TopicMessage {
    TopicMessage {
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        // 🕳️ A tombstone has no payload. Empty bytes fail parsing and get dead-lettered.
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

#[async_trait]
impl Subscriber for KafkaSubscriber {
    async fn assign(&mut self, resume: &BTreeMap<i32, i64>, policy: StartPolicy) -> Result<Vec<i32>> {
        // ⚠️ fetch_metadata blocks the thread for up to metadata_timeout. Startup only, once.
        let metadata = self
            .consumer
            .fetch_metadata(Some(&self.topic), self.metadata_timeout)
            .with_context(|| format!("💀 Could not fetch metadata for topic '{}'.", self.topic))?;

        let partitions: Vec<i32> = metadata
            .topics()
            .iter()
            .filter(|topic| topic.name() == self.topic)
            .flat_map(|topic| topic.partitions().iter().map(|partition| partition.id()))
            .collect();
        if partitions.is_empty() {
            bail!(
                "💀 Topic '{}' has no partitions. Does it exist yet? Run the producer once, or create it.",
                self.topic
            );
        }

        let mut assignment = TopicPartitionList::new();
        for partition in &partitions {
            let offset = match resume.get(partition) {
                Some(next) => Offset::Offset(*next),
                None => fallback_offset(policy),
            };
            debug!("📍 partition {partition} starts at {offset:?}");
            assignment
                .add_partition_offset(&self.topic, *partition, offset)
                .with_context(|| format!("💀 Could not place partition {partition} at {offset:?}."))?;
        }
        self.consumer
            .assign(&assignment)
            .with_context(|| format!("💀 Could not assign partitions of '{}'.", self.topic))?;

        info!("📥 Assigned {} partitions of '{}'", partitions.len(), self.topic);
        Ok(partitions)
    }

    async fn poll_batch(&mut self, max: usize, wait: Duration) -> Result<Vec<TopicMessage>> {
        let mut batch = Vec::with_capacity(max.min(1024));
        let deadline = Instant::now() + wait;
        while batch.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let budget = if batch.is_empty() {
                remaining
            } else {
                remaining.min(BATCH_LINGER)
            };
            match tokio::time::timeout(budget, self.consumer.recv()).await {
                Ok(Ok(message)) => batch.push(owned_message(&message)),
                Ok(Err(err)) => {
                    // Return what we have. The next poll will try again.
                    warn!("⚠️ Kafka consumer error while polling '{}': {err}", self.topic);
                    let pause = error_pause(batch.is_empty(), deadline.saturating_duration_since(Instant::now()));
                    if !pause.is_zero() {
                        tokio::time::sleep(pause).await;
                    }
                    break;
                }
                Err(_elapsed) => break,
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_a_full_queue_counts_as_a_timeout() {
        let timeout = Duration::from_secs(5);
        assert!(matches!(
            classify_send_error(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), timeout),
            PipelineError::PublishTimeout(t) if t == timeout
        ));
        assert!(matches!(
            classify_send_error(KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut), timeout),
            PipelineError::PublishTimeout(_)
        ));
        assert!(matches!(
            classify_send_error(
                KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopicOrPartition),
                timeout
            ),
            PipelineError::PublishFailure(_)
        ));
    }

    #[test]
    fn the_one_where_start_policies_map_to_librdkafka_words() {
        assert_eq!(auto_offset_reset(StartPolicy::Earliest), "earliest");
        assert_eq!(auto_offset_reset(StartPolicy::Latest), "latest");
        assert_eq!(fallback_offset(StartPolicy::Earliest), Offset::Beginning);
        assert_eq!(fallback_offset(StartPolicy::Latest), Offset::End);
    }

    #[test]
    fn the_one_where_an_erroring_broker_is_polled_at_the_poll_rate() {
        let remaining = Duration::from_millis(300);
        assert_eq!(error_pause(true, remaining), remaining);
        assert_eq!(error_pause(false, remaining), Duration::ZERO);
        assert_eq!(error_pause(true, Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn the_one_where_clients_build_without_a_broker_in_sight() {
        // librdkafka connects lazily, so construction works with nothing listening.
        // The stream consumer still wants a runtime around to hand its wakeups to.
        let config = BrokerConfig {
            bootstrap_servers: "127.0.0.1:1".to_string(),
            ..BrokerConfig::default()
        };
        let publisher = KafkaPublisher::new(&config, Duration::from_millis(100))
            .expect("💀 producer construction should not need a broker");
        assert!(format!("{publisher:?}").contains("user_stream"));
        KafkaSubscriber::new(&config, "test-group", StartPolicy::Earliest)
            .expect("💀 consumer construction should not need a broker");
    }
}
