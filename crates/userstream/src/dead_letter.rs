//! 🪦 The dead-letter lounge, where messages that failed the bouncer go to wait.
//!
//! Every dead letter gets a `warn!` line with enough detail to find it on the
//! topic again. If a dead-letter file is configured, it also gets one NDJSON line
//! appended there. Writing that file is best-effort: a full disk should not stop
//! good users from reaching the table.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::transform::DeadLetter;

/// 🪦 Where dead letters end up.
#[derive(Debug)]
pub(crate) enum DeadLetterSink {
    /// 📜 Logged and counted, nothing more.
    Log,
    /// 📁 Logged, counted, and appended to an NDJSON file.
    File(PathBuf),
}

impl DeadLetterSink {
    pub(crate) fn new(path: Option<PathBuf>) -> Self {
        match path {
            Some(path) => DeadLetterSink::File(path),
            None => DeadLetterSink::Log,
        }
    }

    /// 🪦 Record one dead letter. Never fails.
    pub(crate) async fn record(&self, dead: &DeadLetter) {
        warn!(
            partition = dead.partition,
            offset = dead.offset,
            kind = dead.error.kind(),
            "🪦 Dead-lettered a message: {}",
            dead.error
        );
        if let DeadLetterSink::File(path) = self {
            if let Err(err) = append_line(path, dead).await {
                warn!("⚠️ Could not append dead letter to '{}': {err}", path.display());
            }
        }
    }
}

#[derive(Serialize)]
struct DeadLetterLine<'a> {
    partition: i32,
    offset: i64,
    kind: &'static str,
    reason: String,
    payload: std::borrow::Cow<'a, str>,
}

async fn append_line(path: &Path, dead: &DeadLetter) -> std::io::Result<()> {
    let line = DeadLetterLine {
        partition: dead.partition,
        offset: dead.offset,
        kind: dead.error.kind(),
        reason: dead.error.to_string(),
        payload: String::from_utf8_lossy(&dead.payload),
    };
    let mut bytes = serde_json::to_vec(&line)?;
    bytes.push(b'\n');

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&bytes).await?;
    file.flush().await
}
