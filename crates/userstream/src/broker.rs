//! ✉️ The Broker: the topic between the producer and the consumer.
//!
//! 🎬 *[a message is born. it has a key. it has a payload. it has no idea what a partition is.]*
//! *[it is about to find out.]*
//!
//! Two seams live here, one per side of the topic:
//! - [`Publisher`]: hands one keyed payload to the topic and waits for the ack.
//! - [`Subscriber`]: gets assigned partitions at explicit positions, then polls batches.
//!
//! Kafka is the real thing. The in-memory broker is a `Vec` per partition with a
//! doorbell, used by tests and the `demo` command so nobody needs Docker to watch
//! a user travel from one end of the pipeline to the other. 🦆
//!
//! Offsets are ours, not the broker's. The consumer never asks Kafka to remember
//! where it was; the checkpoint does that. So the subscriber is always told
//! exactly where to start.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::PipelineError;
use crate::workers::consumer_worker::StartPolicy;

pub(crate) mod in_mem;
pub(crate) mod kafka;

pub(crate) use in_mem::{InMemoryBroker, InMemoryPublisher, InMemorySubscriber};
pub(crate) use kafka::{KafkaPublisher, KafkaSubscriber};

/// 📡 How to find the broker and which topic to talk about.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    /// ⏱️ How long the consumer waits for topic metadata while assigning partitions.
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,
    /// 🔧 Raw librdkafka properties (`security.protocol`, `sasl.*`, ...), passed through untouched.
    #[serde(default)]
    pub client_properties: BTreeMap<String, String>,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_topic() -> String {
    "user_stream".to_string()
}

fn default_metadata_timeout_ms() -> u64 {
    10_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            topic: default_topic(),
            metadata_timeout_ms: default_metadata_timeout_ms(),
            client_properties: BTreeMap::new(),
        }
    }
}

impl BrokerConfig {
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }
}

/// 📨 One message as read off the topic. Owned, so it can cross a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

// ===== Publisher Trait and Backend Enum =====

/// 📤 Something that can put one keyed payload on the topic.
///
/// # Contract 📜
/// - Resolves only once the broker acknowledged the message, or clearly didn't.
/// - No ack inside the send timeout is [`PipelineError::PublishTimeout`].
/// - Anything else the broker (or its absence) says is [`PipelineError::PublishFailure`].
/// - No retries in here. The producer loop owns that policy.
#[async_trait]
pub(crate) trait Publisher: std::fmt::Debug + Send {
    /// 📤 Publish `payload` keyed by `key`. Same key, same partition, same order.
    async fn publish(&mut self, key: &str, payload: &[u8]) -> Result<(), PipelineError>;
}

/// 🎭 The many faces of a Publisher.
#[derive(Debug)]
pub(crate) enum PublisherBackend {
    Kafka(KafkaPublisher),
    InMemory(InMemoryPublisher),
}

#[async_trait]
impl Publisher for PublisherBackend {
    async fn publish(&mut self, key: &str, payload: &[u8]) -> Result<(), PipelineError> {
        match self {
            PublisherBackend::Kafka(publisher) => publisher.publish(key, payload).await,
            PublisherBackend::InMemory(publisher) => publisher.publish(key, payload).await,
        }
    }
}

// ===== Subscriber Trait and Backend Enum =====

/// 📥 Something that reads the topic from positions we choose.
///
/// # Contract 📜
/// - `assign` must be called once before `poll_batch`. It discovers the topic's
///   partitions and places each one at `resume[partition]` if present, else at
///   whatever the [`StartPolicy`] says. Returns the partitions it assigned.
/// - `poll_batch` returns at most `max` messages, waiting up to `wait` for the
///   first one. An empty Vec means "nothing right now", not "end of stream".
/// - Messages from one partition come back in offset order.
#[async_trait]
pub(crate) trait Subscriber: std::fmt::Debug + Send {
    /// 📍 Assign every partition of the topic at an explicit starting position.
    async fn assign(&mut self, resume: &BTreeMap<i32, i64>, policy: StartPolicy) -> Result<Vec<i32>>;
    /// 📦 Fetch the next batch. Waits, never spins.
    async fn poll_batch(&mut self, max: usize, wait: Duration) -> Result<Vec<TopicMessage>>;
}

/// 🎭 The many faces of a Subscriber.
#[derive(Debug)]
pub(crate) enum SubscriberBackend {
    Kafka(KafkaSubscriber),
    InMemory(InMemorySubscriber),
}

#[async_trait]
impl Subscriber for SubscriberBackend {
    async fn assign(&mut self, resume: &BTreeMap<i32, i64>, policy: StartPolicy) -> Result<Vec<i32>> {
        match self {
            SubscriberBackend::Kafka(subscriber) => subscriber.assign(resume, policy).await,
            SubscriberBackend::InMemory(subscriber) => subscriber.assign(resume, policy).await,
        }
    }

    async fn poll_batch(&mut self, max: usize, wait: Duration) -> Result<Vec<TopicMessage>> {
        match self {
            SubscriberBackend::Kafka(subscriber) => subscriber.poll_batch(max, wait).await,
            SubscriberBackend::InMemory(subscriber) => subscriber.poll_batch(max, wait).await,
        }
    }
}
