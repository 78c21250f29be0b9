use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::errors::PipelineError;

/// 📁 A checkpoint that lives in one JSON file.
///
/// Writes go to a sibling `.tmp` file first, get fsync'd, then get renamed over
/// the real one. A crash mid-write leaves the previous checkpoint intact instead
/// of half a JSON object.
#[derive(Debug)]
pub(crate) struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn staging_path(&self) -> PathBuf {
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        PathBuf::from(staging)
    }

    async fn write_atomically(&self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.staging_path();
        let mut file = tokio::fs::File::create(&staging).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&staging, &self.path).await
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpoint {
    async fn load(&self) -> Result<Option<Checkpoint>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("📍 No checkpoint at {}. First run, starting fresh.", self.path.display());
                return Ok(None);
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("💀 Could not read checkpoint file '{}'.", self.path.display())
                });
            }
        };
        let checkpoint = serde_json::from_slice(&bytes).with_context(|| {
            format!(
                "💀 Checkpoint file '{}' is not a checkpoint. Fix it or delete it to start over.",
                self.path.display()
            )
        })?;
        Ok(Some(checkpoint))
    }

    async fn persist(&mut self, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
        let bytes = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| PipelineError::CheckpointPersist(e.to_string()))?;
        self.write_atomically(&bytes).await.map_err(|e| {
            PipelineError::CheckpointPersist(format!("{}: {e}", self.path.display()))
        })?;
        debug!("💾 Checkpoint written to {}: {:?}", self.path.display(), checkpoint.next_offsets);
        Ok(())
    }
}
