//! 🎬 *[the topic hums. the consumer has been awake for nine days.]*
//! *[it has seen things. malformed things. things with numeric postcodes.]*
//! *[it does not flinch. it dead-letters them and moves on.]*
//!
//! 📥 The ConsumerWorker: read batches off the topic, parse them, write the good
//! ones, checkpoint, repeat, forever or until stopped.
//!
//! Two halves run side by side on one task, joined by a small bounded channel:
//! - the fetcher polls and transforms, and stops polling when asked to;
//! - the writer takes batches in fetch order and commits each one through the
//!   checkpointed sink before even looking at the next.
//!
//! The channel bound is how many batches can be fetched-but-not-yet-written at
//! once. The single writer is why checkpoints can only ever advance in order.
//! If the writer hits a fatal error it hangs up the channel, the fetcher notices
//! before its next poll, and the whole thing winds down with the checkpoint pointing
//! at the last batch that truly made it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::Worker;
use crate::broker::Subscriber;
use crate::checkpoint::CheckpointStore;
use crate::dead_letter::DeadLetterSink;
use crate::errors::PipelineError;
use crate::sink::{CheckpointedSink, SinkSettings};
use crate::stop::StopSignal;
use crate::store::UserStore;
use crate::transform::{TransformedBatch, transform_batch};

/// 📍 Where to start on a partition the checkpoint has never seen.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartPolicy {
    /// ⏮️ From the oldest message still on the topic.
    #[default]
    Earliest,
    /// ⏭️ Only messages published after we showed up.
    Latest,
}

/// 🔧 Knobs for the consumer.
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerConfig {
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default)]
    pub start_policy: StartPolicy,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// ⏱️ How long one poll waits for the first message of a batch.
    #[serde(default = "default_poll_wait_ms")]
    pub poll_wait_ms: u64,
    /// 📦 Batches fetched but not yet written, at most.
    #[serde(default = "default_max_in_flight_batches")]
    pub max_in_flight_batches: usize,
    /// ✍️ Concurrent upserts within one batch.
    #[serde(default = "default_write_concurrency")]
    pub write_concurrency: usize,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// 🪦 Optional NDJSON file for dead letters. Log-only when unset.
    #[serde(default)]
    pub dead_letter_path: Option<PathBuf>,
}

fn default_group_id() -> String {
    "user_stream_sink".to_string()
}

fn default_max_batch_size() -> usize {
    100
}

fn default_poll_wait_ms() -> u64 {
    1_000
}

fn default_max_in_flight_batches() -> usize {
    2
}

fn default_write_concurrency() -> usize {
    8
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            start_policy: StartPolicy::default(),
            max_batch_size: default_max_batch_size(),
            poll_wait_ms: default_poll_wait_ms(),
            max_in_flight_batches: default_max_in_flight_batches(),
            write_concurrency: default_write_concurrency(),
            write_timeout_ms: default_write_timeout_ms(),
            dead_letter_path: None,
        }
    }
}

impl ConsumerConfig {
    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    fn sink_settings(&self) -> SinkSettings {
        SinkSettings {
            write_concurrency: self.write_concurrency.max(1),
            write_timeout: self.write_timeout(),
        }
    }
}

/// 🚦 Where the consumer is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// 🐣 Creating the schema, reading the checkpoint.
    Starting,
    /// 📍 Partitions assigned, nothing polled yet.
    Subscribed,
    /// ⚙️ Working through a batch.
    Processing,
    /// 💤 The last poll came back empty.
    Idle,
    /// 🛑 Done, for whatever reason.
    Stopped,
}

/// 📊 What one consumer run got through. Only committed batches are counted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub batches: u64,
    pub messages: u64,
    pub rows_written: u64,
    pub dead_letters: u64,
    /// 📍 The checkpoint as last persisted.
    pub next_offsets: BTreeMap<i32, i64>,
}

/// 📥 Subscriber, store and checkpoint, all owned, all for one topic.
#[derive(Debug)]
pub(crate) struct ConsumerWorker<B, S, C> {
    subscriber: B,
    store: S,
    checkpoints: C,
    topic: String,
    config: ConsumerConfig,
    stop: StopSignal,
    state: watch::Sender<ConsumerState>,
}

impl<B, S, C> ConsumerWorker<B, S, C>
where
    B: Subscriber + 'static,
    S: UserStore + 'static,
    C: CheckpointStore + 'static,
{
    pub(crate) fn new(
        subscriber: B,
        store: S,
        checkpoints: C,
        topic: impl Into<String>,
        config: ConsumerConfig,
        stop: StopSignal,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Starting);
        Self {
            subscriber,
            store,
            checkpoints,
            topic: topic.into(),
            config,
            stop,
            state,
        }
    }

    /// 👀 Watch the state machine from the outside.
    pub(crate) fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub(crate) async fn run(self) -> Result<ConsumerReport> {
        let Self {
            subscriber,
            store,
            checkpoints,
            topic,
            config,
            stop,
            state,
        } = self;

        state.send_replace(ConsumerState::Starting);
        let outcome = pipeline(subscriber, store, checkpoints, &topic, &config, stop, &state).await;
        state.send_replace(ConsumerState::Stopped);

        match &outcome {
            Ok(report) => info!(
                "🏁 Consumer stopped: {} batches, {} messages, {} rows, {} dead letters",
                report.batches, report.messages, report.rows_written, report.dead_letters
            ),
            Err(err) => info!("🛑 Consumer stopped on error: {err:#}"),
        }
        outcome
    }
}

async fn pipeline<B, S, C>(
    mut subscriber: B,
    store: S,
    checkpoints: C,
    topic: &str,
    config: &ConsumerConfig,
    stop: StopSignal,
    state: &watch::Sender<ConsumerState>,
) -> Result<ConsumerReport>
where
    B: Subscriber,
    S: UserStore,
    C: CheckpointStore,
{
    let mut sink = CheckpointedSink::open(store, checkpoints, &config.group_id, topic, config.sink_settings())
        .await
        .context("💀 Consumer could not get started")?;

    let partitions = subscriber
        .assign(sink.resume_positions(), config.start_policy)
        .await
        .context("💀 Consumer could not assign partitions")?;
    state.send_replace(ConsumerState::Subscribed);
    info!(
        "📥 Consuming '{topic}' as '{}' on partitions {partitions:?}",
        config.group_id
    );

    let dead_letters = DeadLetterSink::new(config.dead_letter_path.clone());
    let (tx, rx) = async_channel::bounded::<TransformedBatch>(config.max_in_flight_batches.max(1));

    let fetcher = async move {
        loop {
            if stop.is_stopped() {
                info!("🛑 Stop requested, no more polling");
                break;
            }
            if tx.is_closed() {
                break;
            }
            let messages = subscriber
                .poll_batch(config.max_batch_size.max(1), config.poll_wait())
                .await
                .context("💀 Polling the topic failed")?;
            if messages.is_empty() {
                state.send_replace(ConsumerState::Idle);
                continue;
            }
            state.send_replace(ConsumerState::Processing);
            let batch = transform_batch(messages);
            debug!(
                "📦 Fetched {} messages ({} dead letters)",
                batch.message_count,
                batch.dead_letters.len()
            );
            if tx.send(batch).await.is_err() {
                // The writer hung up. Its error is the one worth reporting.
                break;
            }
        }
        drop(tx);
        Ok::<(), anyhow::Error>(())
    };

    let writer = async {
        let outcome = drain(&mut sink, &rx, &dead_letters).await;
        rx.close();
        outcome
    };

    let (fetched, written) = tokio::join!(fetcher, writer);
    let report = written.map_err(|err| {
        let context = if err.is_fatal() {
            "💀 Consumer hit a fatal error, checkpoint left at the last committed batch"
        } else {
            "💀 Consumer could not commit a batch, checkpoint left at the last committed batch"
        };
        anyhow::Error::new(err).context(context)
    })?;
    fetched?;
    Ok(report)
}

/// ✍️ Commit batches strictly in the order they were fetched.
async fn drain<S: UserStore, C: CheckpointStore>(
    sink: &mut CheckpointedSink<S, C>,
    rx: &async_channel::Receiver<TransformedBatch>,
    dead_letters: &DeadLetterSink,
) -> Result<ConsumerReport, PipelineError> {
    let mut report = ConsumerReport {
        next_offsets: sink.resume_positions().clone(),
        ..ConsumerReport::default()
    };
    while let Ok(batch) = rx.recv().await {
        for dead in &batch.dead_letters {
            dead_letters.record(dead).await;
        }
        let written = sink.commit_batch(batch.records, &batch.positions).await?;

        report.batches += 1;
        report.messages += batch.message_count as u64;
        report.rows_written += written as u64;
        report.dead_letters += batch.dead_letters.len() as u64;
        report.next_offsets = sink.checkpoint().next_offsets.clone();
        debug!("📍 Batch committed, checkpoint now {:?}", report.next_offsets);
    }
    Ok(report)
}

impl<B, S, C> Worker for ConsumerWorker<B, S, C>
where
    B: Subscriber + 'static,
    S: UserStore + 'static,
    C: CheckpointStore + 'static,
{
    type Report = ConsumerReport;

    fn start(self) -> JoinHandle<Result<ConsumerReport>> {
        tokio::spawn(self.run())
    }
}
