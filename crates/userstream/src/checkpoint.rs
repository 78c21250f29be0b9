//! 📍 Checkpoints: the consumer's bookmark, written in pen.
//!
//! 🎬 *[the consumer wakes up. it does not remember yesterday.]*
//! *[it reaches for the nightstand. there is a JSON file. it reads: `{"0": 412}`.]*
//! *[it nods. it knows where it is. it gets dressed.]*
//!
//! One [`Checkpoint`] per consumer group and topic: partition → next offset to read.
//! It only ever moves forward, and it only moves after the rows it covers are in
//! the table. The second rule is enforced by `sink::CheckpointedSink`; the first
//! one lives right here in [`Checkpoint::advance`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;

mod file;
mod in_mem;

pub(crate) use file::FileCheckpoint;
pub(crate) use in_mem::InMemoryCheckpoint;

/// 🔧 Where the checkpoint file lives.
#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointConfig {
    #[serde(default = "default_path")]
    pub path: PathBuf,
}

fn default_path() -> PathBuf {
    PathBuf::from("/tmp/checkpoint/user_stream.json")
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
        }
    }
}

/// 📍 Progress for one (group, topic): the next offset to read, per partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub group_id: String,
    pub topic: String,
    pub next_offsets: BTreeMap<i32, i64>,
}

impl Checkpoint {
    /// 🐣 A brand-new group that has read nothing yet.
    pub fn new(group_id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topic: topic.into(),
            next_offsets: BTreeMap::new(),
        }
    }

    /// ⏩ Merge in new positions. A partition only ever moves forward.
    ///
    /// Returns true if anything actually moved, so callers can skip a pointless write.
    pub fn advance(&mut self, positions: &BTreeMap<i32, i64>) -> bool {
        let mut moved = false;
        for (partition, next) in positions {
            let current = self.next_offsets.entry(*partition).or_insert(i64::MIN);
            if *next > *current {
                *current = *next;
                moved = true;
            }
        }
        moved
    }
}

// ===== CheckpointStore Trait and Backend Enum =====

/// 💾 Durable home for a [`Checkpoint`].
///
/// # Contract 📜
/// - `load` returns `Ok(None)` on first run. A checkpoint that exists but can't be read is an error.
/// - `persist` returns only once the checkpoint would survive a crash. Failure is
///   [`PipelineError::CheckpointPersist`], and the consumer treats that as fatal.
#[async_trait]
pub(crate) trait CheckpointStore: std::fmt::Debug + Send + Sync {
    async fn load(&self) -> Result<Option<Checkpoint>>;
    async fn persist(&mut self, checkpoint: &Checkpoint) -> Result<(), PipelineError>;
}

/// 🎭 The many faces of a CheckpointStore.
#[derive(Debug)]
pub(crate) enum CheckpointBackend {
    File(FileCheckpoint),
    InMemory(InMemoryCheckpoint),
}

impl CheckpointBackend {
    pub(crate) fn from_config(config: &CheckpointConfig) -> Self {
        CheckpointBackend::File(FileCheckpoint::new(config.path.clone()))
    }
}

#[async_trait]
impl CheckpointStore for CheckpointBackend {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        match self {
            CheckpointBackend::File(store) => store.load().await,
            CheckpointBackend::InMemory(store) => store.load().await,
        }
    }

    async fn persist(&mut self, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
        match self {
            CheckpointBackend::File(store) => store.persist(checkpoint).await,
            CheckpointBackend::InMemory(store) => store.persist(checkpoint).await,
        }
    }
}
