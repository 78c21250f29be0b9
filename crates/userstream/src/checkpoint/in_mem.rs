use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::errors::PipelineError;

/// 🧠 A checkpoint that lives in RAM, shared by every clone.
///
/// Clone it before handing it to the sink and the test can still peek inside,
/// count the writes, or pull the plug on the next persist.
#[derive(Debug, Clone, Default)]
pub(crate) struct InMemoryCheckpoint {
    saved: Arc<Mutex<Option<Checkpoint>>>,
    persists: Arc<AtomicUsize>,
    refuse_persist: Arc<AtomicBool>,
}

impl InMemoryCheckpoint {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 🔍 What's saved right now.
    pub(crate) async fn saved(&self) -> Option<Checkpoint> {
        self.saved.lock().await.clone()
    }

    /// 🔢 How many persists went through.
    #[cfg(test)]
    pub(crate) fn persist_count(&self) -> usize {
        self.persists.load(Ordering::SeqCst)
    }

    /// 🔌 Make every following persist fail, like a full disk would.
    #[cfg(test)]
    pub(crate) fn refuse_persists(&self, refuse: bool) {
        self.refuse_persist.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpoint {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        Ok(self.saved().await)
    }

    async fn persist(&mut self, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
        if self.refuse_persist.load(Ordering::SeqCst) {
            return Err(PipelineError::CheckpointPersist(
                "in-memory checkpoint is refusing writes".to_string(),
            ));
        }
        *self.saved.lock().await = Some(checkpoint.clone());
        self.persists.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
