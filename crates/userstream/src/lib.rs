//! 🚰 userstream: fake people in one end, real Cassandra rows out the other.
//!
//! 🎬 *[narrator voice]* "Somewhere, an API invents a person. Ten milliseconds
//! later, that person has a partition, an offset, and a primary key."
//!
//! The pipeline, left to right:
//! ```text
//!  randomuser.me ─▶ ProducerWorker ─▶ Kafka `user_stream` ─▶ ConsumerWorker ─▶ Cassandra
//!                                                              │
//!                                                              └─▶ checkpoint (after the rows)
//! ```
//! The entry points here wire the real backends together from an [`AppConfig`].
//! [`demo`] wires the in-memory ones instead, so the whole loop can run on a laptop
//! with no broker and no cluster. 🦆

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::{debug, info};

pub mod app_config;
pub mod errors;
pub mod record;
pub mod stop;

pub(crate) mod broker;
pub(crate) mod checkpoint;
pub(crate) mod dead_letter;
pub(crate) mod generator;
pub(crate) mod sink;
pub(crate) mod store;
pub(crate) mod transform;
pub(crate) mod workers;

pub use checkpoint::Checkpoint;
pub use record::UserRecord;
pub use stop::{StopHandle, StopSignal, stop_pair};
pub use workers::{ConsumerReport, ConsumerState, ProducerReport};

use crate::app_config::{AppConfig, StartPolicy};
use crate::broker::{InMemoryBroker, KafkaPublisher, KafkaSubscriber, PublisherBackend, SubscriberBackend};
use crate::checkpoint::{CheckpointBackend, InMemoryCheckpoint};
use crate::generator::SourceBackend;
use crate::store::{InMemoryStore, StoreBackend, UserStore};
use crate::workers::Worker;
use crate::workers::consumer_worker::ConsumerWorker;
use crate::workers::producer_worker::ProducerWorker;

/// 🧮 Partitions on the demo's pretend topic.
const DEMO_PARTITIONS: usize = 3;

/// 🚰 Run the producer against the configured source and Kafka until the window
/// closes, `max_messages` is reached, or `stop` fires.
pub async fn produce(app_config: AppConfig, stop: StopSignal) -> Result<ProducerReport> {
    let source = SourceBackend::from_config(&app_config.source).context("💀 Could not build the record source")?;
    let publisher = KafkaPublisher::new(&app_config.broker, app_config.producer.send_timeout())
        .context("💀 Could not build the Kafka producer")?;
    info!(
        "🚰 Producing to '{}' on {} for {:?}",
        app_config.broker.topic,
        app_config.broker.bootstrap_servers,
        app_config.producer.window()
    );

    ProducerWorker::new(source, PublisherBackend::Kafka(publisher), app_config.producer, stop)
        .start()
        .await
        .context("💀 The producer task panicked")?
}

/// 📥 Run the consumer against Kafka and Cassandra until `stop` fires or something fatal happens.
pub async fn consume(app_config: AppConfig, stop: StopSignal) -> Result<ConsumerReport> {
    let store = StoreBackend::from_config(&app_config.store).await?;
    let checkpoints = CheckpointBackend::from_config(&app_config.checkpoint);
    let subscriber = KafkaSubscriber::new(
        &app_config.broker,
        &app_config.consumer.group_id,
        app_config.consumer.start_policy,
    )
    .context("💀 Could not build the Kafka consumer")?;
    info!(
        "📥 Consuming '{}' as group '{}' into {}.{}",
        app_config.broker.topic, app_config.consumer.group_id, app_config.store.keyspace, app_config.store.table
    );

    ConsumerWorker::new(
        SubscriberBackend::Kafka(subscriber),
        store,
        checkpoints,
        app_config.broker.topic,
        app_config.consumer,
        stop,
    )
    .start()
    .await
    .context("💀 The consumer task panicked")?
}

/// 🔎 One user by id, straight from the table. `None` when nobody has that id.
pub async fn lookup(app_config: &AppConfig, id: &str) -> Result<Option<UserRecord>> {
    let store = StoreBackend::from_config(&app_config.store).await?;
    Ok(store.get(id).await?)
}

/// 🧮 How many users the table holds.
pub async fn count(app_config: &AppConfig) -> Result<u64> {
    let store = StoreBackend::from_config(&app_config.store).await?;
    Ok(store.count().await?)
}

/// 👀 A peek at the first `n` rows.
pub async fn head(app_config: &AppConfig, n: usize) -> Result<Vec<UserRecord>> {
    let store = StoreBackend::from_config(&app_config.store).await?;
    Ok(store.first_n(n).await?)
}

/// 📊 Everything the demo run saw.
#[derive(Debug, Clone)]
pub struct DemoReport {
    pub producer: ProducerReport,
    pub consumer: ConsumerReport,
    /// 📍 End of each non-empty partition of the pretend topic once the producer was done.
    pub topic_end_offsets: BTreeMap<i32, i64>,
    /// 🔖 The checkpoint the consumer left behind.
    pub checkpoint: Option<Checkpoint>,
    pub row_count: u64,
    pub rows: Vec<UserRecord>,
}

/// 🎪 The whole pipeline in one process: configured source, in-memory topic,
/// in-memory table, in-memory checkpoint.
///
/// Publishes `messages` users, then consumes from the earliest offset until the
/// consumer goes idle, then stops it and reports.
pub async fn demo(app_config: AppConfig, messages: u64) -> Result<DemoReport> {
    let broker = InMemoryBroker::new(DEMO_PARTITIONS);
    let store = InMemoryStore::new();
    let checkpoints = InMemoryCheckpoint::new();

    let source = SourceBackend::from_config(&app_config.source).context("💀 Could not build the record source")?;
    let mut producer_config = app_config.producer.clone();
    producer_config.max_messages = Some(messages);
    let producer = ProducerWorker::new(
        source,
        PublisherBackend::InMemory(broker.publisher()),
        producer_config,
        StopSignal::never(),
    )
    .start()
    .await
    .context("💀 The demo producer task panicked")??;
    let topic_end_offsets: BTreeMap<i32, i64> = broker
        .end_offsets()
        .await
        .into_iter()
        .filter(|(_, end)| *end > 0)
        .collect();
    info!("🎪 Demo topic holds {} messages, consuming them now", broker.len().await);

    let mut consumer_config = app_config.consumer.clone();
    consumer_config.start_policy = StartPolicy::Earliest;
    let (stop_handle, stop) = stop_pair();
    let worker = ConsumerWorker::new(
        SubscriberBackend::InMemory(broker.subscriber()),
        StoreBackend::InMemory(store.clone()),
        CheckpointBackend::InMemory(checkpoints.clone()),
        app_config.broker.topic,
        consumer_config,
        stop,
    );
    let mut state = worker.state();
    let running = worker.start();

    // 💤 Idle means a poll came back empty, so everything on the topic has been fetched.
    if state
        .wait_for(|state| matches!(state, ConsumerState::Idle | ConsumerState::Stopped))
        .await
        .is_err()
    {
        debug!("🛑 Demo consumer went away before it ever went idle, its own result says why");
    }
    stop_handle.stop();
    let consumer = running.await.context("💀 The demo consumer task panicked")??;

    let sample_size = usize::try_from(messages).unwrap_or(usize::MAX).min(10);
    Ok(DemoReport {
        producer,
        consumer,
        topic_end_offsets,
        checkpoint: checkpoints.saved().await,
        row_count: store.count().await?,
        rows: store.first_n(sample_size).await?,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::Subscriber;
    use crate::generator::{FixtureSource, RecordSource, SourceConfig};

    fn offline_config() -> AppConfig {
        let mut app_config = AppConfig::default();
        app_config.source = SourceConfig::Fixture;
        app_config.producer.window_ms = 30_000;
        app_config.consumer.poll_wait_ms = 50;
        app_config.consumer.max_batch_size = 4;
        app_config
    }

    #[tokio::test]
    async fn the_one_where_the_whole_pipeline_runs_in_one_process() {
        let report = demo(offline_config(), 10).await.expect("💀 demo failed");

        assert_eq!(report.producer.published, 10);
        assert_eq!(report.consumer.rows_written, 10);
        assert_eq!(report.consumer.dead_letters, 0);
        assert_eq!(report.row_count, 10);
        assert_eq!(report.rows.len(), 10);

        let checkpoint = report.checkpoint.expect("💀 the demo never checkpointed");
        assert_eq!(checkpoint.next_offsets, report.topic_end_offsets);
        assert_eq!(checkpoint.next_offsets.values().sum::<i64>(), 10);
        assert_eq!(report.consumer.next_offsets, report.topic_end_offsets);

        let mut ids: Vec<&str> = report.rows.iter().map(|row| row.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 10, "every published user should be its own row");
        assert!(report.rows.iter().all(|row| !row.email.is_empty()));
    }

    #[tokio::test]
    async fn the_one_where_every_published_user_can_be_looked_up_by_id() {
        let broker = InMemoryBroker::new(DEMO_PARTITIONS);
        let store = InMemoryStore::new();
        let checkpoints = InMemoryCheckpoint::new();
        let app_config = offline_config();

        let mut producer_config = app_config.producer.clone();
        producer_config.max_messages = Some(3);
        let produced = ProducerWorker::new(
            FixtureSource::default(),
            broker.publisher(),
            producer_config,
            StopSignal::never(),
        )
        .run()
        .await
        .expect("💀 producer failed");
        assert_eq!(produced.published, 3);

        // 📬 Read the topic once on the side, to learn which ids went out.
        let mut reader = broker.subscriber();
        reader
            .assign(&BTreeMap::new(), StartPolicy::Earliest)
            .await
            .expect("💀 assign failed");
        let published = reader
            .poll_batch(10, Duration::from_millis(50))
            .await
            .expect("💀 poll failed");
        assert_eq!(published.len(), 3);

        let (stop_handle, stop) = stop_pair();
        let worker = ConsumerWorker::new(
            broker.subscriber(),
            store.clone(),
            checkpoints.clone(),
            "user_stream",
            app_config.consumer.clone(),
            stop,
        );
        let mut state = worker.state();
        let running = worker.start();
        state
            .wait_for(|state| matches!(state, ConsumerState::Idle | ConsumerState::Stopped))
            .await
            .expect("💀 consumer vanished without a state");
        stop_handle.stop();
        running
            .await
            .expect("💀 consumer task panicked")
            .expect("💀 consumer failed");

        let template = FixtureSource::default().fetch().await.expect("💀 fixture failed");
        for message in &published {
            let id = String::from_utf8(message.key.clone().expect("💀 unkeyed message")).expect("💀 key is not utf-8");
            let parsed = uuid::Uuid::parse_str(&id).expect("💀 id is not a uuid");
            assert_eq!(parsed.get_version(), Some(uuid::Version::Random), "{id} is not a v4 uuid");

            let row = store
                .get(&id)
                .await
                .expect("💀 lookup failed")
                .expect("💀 published user missing from the table");
            assert_eq!(row.id, id);
            for ((name, stored), (_, expected)) in row.fields().iter().zip(template.fields().iter()).skip(1) {
                assert_eq!(stored, expected, "`{name}` changed on the way through");
            }
        }
    }

    #[tokio::test]
    async fn the_one_where_a_zero_message_demo_is_just_quiet() {
        let report = demo(offline_config(), 0).await.expect("💀 demo failed");
        assert_eq!(report.producer.published, 0);
        assert_eq!(report.row_count, 0);
        assert!(report.checkpoint.is_none());
    }

    #[tokio::test]
    async fn the_one_where_nobody_is_listening_on_the_kafka_port() {
        let mut app_config = offline_config();
        app_config.broker.bootstrap_servers = "127.0.0.1:1".into();
        app_config.producer.window_ms = 600;
        app_config.producer.send_timeout_ms = 150;

        let report = produce(app_config, StopSignal::never())
            .await
            .expect("💀 publish failures should be counted, not fatal");
        assert_eq!(report.published, 0);
        assert!(report.ticks >= 1);
        assert_eq!(report.publish_failures, report.ticks);
        assert!(report.elapsed >= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn the_one_where_the_cassandra_port_is_a_void() {
        let mut app_config = offline_config();
        app_config.store.nodes = vec!["127.0.0.1:1".into()];
        app_config.store.connect_timeout_ms = 500;

        let err = count(&app_config).await.expect_err("💀 port 1 has no Cassandra");
        assert!(format!("{err:#}").contains("Could not connect to Cassandra"));
    }
}
