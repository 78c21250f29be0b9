//! 🧠 A broker that lives in RAM and dies with the process.
//!
//! Partitions are `Vec`s behind one `tokio::sync::Mutex`, and a `Notify` rings
//! whenever something lands, so an idle subscriber sleeps instead of spinning.
//! Keys are hashed onto partitions the same way every time, so per-key order
//! holds here just like it does on the real thing.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::broker::{Publisher, Subscriber, TopicMessage};
use crate::errors::PipelineError;
use crate::workers::consumer_worker::StartPolicy;

/// 📦 The shared topic. Clone it as often as you like, every clone is the same topic.
#[derive(Debug, Clone)]
pub(crate) struct InMemoryBroker {
    inner: Arc<Topic>,
}

#[derive(Debug)]
struct Topic {
    partitions: Mutex<Vec<Vec<TopicMessage>>>,
    doorbell: Notify,
}

impl InMemoryBroker {
    /// 🏗️ A topic with `partitions` partitions. Zero gets bumped to one, a topic needs somewhere to put things.
    pub(crate) fn new(partitions: usize) -> Self {
        let partitions = partitions.max(1);
        Self {
            inner: Arc::new(Topic {
                partitions: Mutex::new(vec![Vec::new(); partitions]),
                doorbell: Notify::new(),
            }),
        }
    }

    pub(crate) fn publisher(&self) -> InMemoryPublisher {
        InMemoryPublisher {
            broker: self.clone(),
        }
    }

    pub(crate) fn subscriber(&self) -> InMemorySubscriber {
        InMemorySubscriber {
            broker: self.clone(),
            positions: None,
        }
    }

    /// 📨 Append a raw payload under `key`. Returns `(partition, offset)`.
    ///
    /// Publishers use this, and so do tests that need to sneak garbage onto the topic.
    pub(crate) async fn append(&self, key: &[u8], payload: &[u8]) -> (i32, i64) {
        let placed = {
            let mut partitions = self.inner.partitions.lock().await;
            let index = partition_for(key, partitions.len());
            let log = &mut partitions[index];
            let offset = log.len() as i64;
            log.push(TopicMessage {
                partition: index as i32,
                offset,
                key: Some(key.to_vec()),
                payload: payload.to_vec(),
            });
            (index as i32, offset)
        };
        self.inner.doorbell.notify_waiters();
        placed
    }

    /// 🔍 Total messages across every partition.
    pub(crate) async fn len(&self) -> usize {
        self.inner.partitions.lock().await.iter().map(Vec::len).sum()
    }

    /// 📏 Per-partition end offsets (the offset the next message would get).
    pub(crate) async fn end_offsets(&self) -> BTreeMap<i32, i64> {
        self.inner
            .partitions
            .lock()
            .await
            .iter()
            .enumerate()
            .map(|(index, log)| (index as i32, log.len() as i64))
            .collect()
    }
}

fn partition_for(key: &[u8], partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

/// 📤 The write end. Never times out, never fails. RAM is a very agreeable broker.
#[derive(Debug, Clone)]
pub(crate) struct InMemoryPublisher {
    broker: InMemoryBroker,
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    async fn publish(&mut self, key: &str, payload: &[u8]) -> Result<(), PipelineError> {
        self.broker.append(key.as_bytes(), payload).await;
        Ok(())
    }
}

/// 📥 The read end. Tracks its own next offset per partition.
#[derive(Debug)]
pub(crate) struct InMemorySubscriber {
    broker: InMemoryBroker,
    positions: Option<BTreeMap<i32, i64>>,
}

impl InMemorySubscriber {
    async fn take(&mut self, max: usize) -> Vec<TopicMessage> {
        let Some(positions) = self.positions.as_mut() else {
            return Vec::new();
        };
        let partitions = self.broker.inner.partitions.lock().await;
        let mut batch = Vec::new();
        for (partition, next) in positions.iter_mut() {
            let log = &partitions[*partition as usize];
            while batch.len() < max {
                let Some(message) = usize::try_from(*next).ok().and_then(|at| log.get(at)) else {
                    break;
                };
                batch.push(message.clone());
                *next += 1;
            }
        }
        batch
    }
}

#[async_trait]
impl Subscriber for InMemorySubscriber {
    async fn assign(&mut self, resume: &BTreeMap<i32, i64>, policy: StartPolicy) -> Result<Vec<i32>> {
        let ends = self.broker.end_offsets().await;
        let positions: BTreeMap<i32, i64> = ends
            .iter()
            .map(|(partition, end)| {
                let start = match resume.get(partition) {
                    Some(next) => *next,
                    None => match policy {
                        StartPolicy::Earliest => 0,
                        StartPolicy::Latest => *end,
                    },
                };
                (*partition, start)
            })
            .collect();
        let assigned = positions.keys().copied().collect();
        self.positions = Some(positions);
        Ok(assigned)
    }

    async fn poll_batch(&mut self, max: usize, wait: Duration) -> Result<Vec<TopicMessage>> {
        if self.positions.is_none() {
            bail!("💀 poll_batch before assign. The subscriber has no idea where to start reading.");
        }
        let deadline = Instant::now() + wait;
        loop {
            // 🔔 Arm the doorbell before looking, so a publish between the look and the wait still wakes us.
            let topic = Arc::clone(&self.broker.inner);
            let doorbell = topic.doorbell.notified();
            tokio::pin!(doorbell);
            doorbell.as_mut().enable();

            let batch = self.take(max).await;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, doorbell).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}
