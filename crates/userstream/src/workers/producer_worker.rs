//! 🎬 *[a clock starts. ten seconds on it.]*
//! *[somewhere, randomuser.me braces itself.]*
//!
//! 🚰 The ProducerWorker: fetch a user, encode it, publish it keyed by `id`,
//! repeat until the window closes or somebody says stop. A failed tick is logged,
//! counted, and forgotten. The loop does not sulk. The loop does not give up.
//! The loop simply tries again, like a golden retriever with a tennis ball.
//!
//! The stop signal is checked once per tick, never in the middle of a publish.
//! A message that is already on its way gets to finish its trip.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Worker;
use crate::broker::Publisher;
use crate::errors::PipelineError;
use crate::generator::RecordSource;
use crate::stop::StopSignal;

/// 🔧 Knobs for the producer loop.
#[derive(Debug, Deserialize, Clone)]
pub struct ProducerConfig {
    /// ⏱️ How long one invocation keeps producing.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// ⏱️ How long one publish may wait for the broker's ack.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// 💤 Pause between ticks. Zero means back-to-back.
    #[serde(default)]
    pub tick_interval_ms: u64,
    /// 🔢 Stop early after this many successful publishes.
    #[serde(default)]
    pub max_messages: Option<u64>,
    #[serde(default)]
    pub publish_retry: PublishRetryConfig,
}

fn default_window_ms() -> u64 {
    10_000
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            tick_interval_ms: 0,
            max_messages: None,
            publish_retry: PublishRetryConfig::default(),
        }
    }
}

impl ProducerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// 🔁 Optional retry around a single publish. One attempt means no retry at all.
#[derive(Debug, Deserialize, Clone)]
pub struct PublishRetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    500
}

impl Default for PublishRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl PublishRetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// 📊 What one producer run got up to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerReport {
    pub ticks: u64,
    pub published: u64,
    pub source_failures: u64,
    pub publish_failures: u64,
    pub elapsed: Duration,
    /// 🛑 True when the stop signal ended the run before the window did.
    pub stopped_early: bool,
}

/// 🚰 Source in one hand, publisher in the other.
#[derive(Debug)]
pub(crate) struct ProducerWorker<S, P> {
    source: S,
    publisher: P,
    config: ProducerConfig,
    stop: StopSignal,
}

impl<S, P> ProducerWorker<S, P>
where
    S: RecordSource + 'static,
    P: Publisher + 'static,
{
    pub(crate) fn new(source: S, publisher: P, config: ProducerConfig, stop: StopSignal) -> Self {
        Self {
            source,
            publisher,
            config,
            stop,
        }
    }

    pub(crate) async fn run(mut self) -> Result<ProducerReport> {
        let started = Instant::now();
        let window = self.config.window();
        let interval = self.config.tick_interval();
        let mut report = ProducerReport::default();
        info!(
            "🚀 Producer running for {window:?} (max_messages: {:?})",
            self.config.max_messages
        );

        loop {
            if self.stop.is_stopped() {
                report.stopped_early = true;
                info!("🛑 Stop requested, producer wrapping up");
                break;
            }
            if started.elapsed() >= window {
                break;
            }
            if self.config.max_messages.is_some_and(|max| report.published >= max) {
                break;
            }

            report.ticks += 1;
            match self.tick().await {
                Ok(id) => {
                    report.published += 1;
                    debug!("📤 Published user {id}");
                }
                Err(err) if !err.skips_tick() => {
                    return Err(err).context("💀 Producer hit an error that costs more than a tick");
                }
                Err(err @ (PipelineError::SourceUnavailable(_) | PipelineError::MalformedSource(_))) => {
                    report.source_failures += 1;
                    warn!(kind = err.kind(), "⚠️ Skipping tick, no user this time: {err}");
                }
                Err(err) => {
                    report.publish_failures += 1;
                    warn!(kind = err.kind(), "⚠️ Skipping tick, user lost in transit: {err}");
                }
            }

            if interval.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = self.stop.stopped() => {}
                }
            }
        }

        report.elapsed = started.elapsed();
        info!(
            "🏁 Producer done: {} published, {} source failures, {} publish failures in {:?}",
            report.published, report.source_failures, report.publish_failures, report.elapsed
        );
        Ok(report)
    }

    /// 🎯 One user, start to finish. Returns the id that went out.
    async fn tick(&mut self) -> Result<String, PipelineError> {
        let record = self.source.fetch().await?;
        let payload = record
            .to_payload()
            .map_err(|e| PipelineError::PublishFailure(format!("could not encode user: {e}")))?;
        self.publish_with_retry(&record.id, &payload).await?;
        Ok(record.id)
    }

    async fn publish_with_retry(&mut self, key: &str, payload: &[u8]) -> Result<(), PipelineError> {
        let max_attempts = self.config.publish_retry.max_attempts.max(1);
        let backoff = self.config.publish_retry.backoff();
        let mut attempt = 1;
        loop {
            match self.publisher.publish(key, payload).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= max_attempts || self.stop.is_stopped() => return Err(err),
                Err(err) => {
                    warn!("🔁 Publish attempt {attempt}/{max_attempts} failed, retrying in {backoff:?}: {err}");
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.stop.stopped() => return Err(err),
                    }
                }
            }
        }
    }
}

impl<S, P> Worker for ProducerWorker<S, P>
where
    S: RecordSource + 'static,
    P: Publisher + 'static,
{
    type Report = ProducerReport;

    fn start(self) -> JoinHandle<Result<ProducerReport>> {
        tokio::spawn(self.run())
    }
}
