//! 💀 The pipeline's error taxonomy. Every way a fake user can fail to become a real row.
//!
//! `anyhow` still carries the context chains at the edges (config, client setup,
//! worker joins). This enum exists because the workers branch on WHICH thing broke:
//! a bad tick gets skipped, a bad message gets dead-lettered, a broken store or
//! checkpoint ends the run. You can't `match` on a context string. Believe us, we tried. 🦆

use std::time::Duration;

use thiserror::Error;

/// 🏷️ Everything that can go sideways between randomuser.me and the Cassandra table.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 📡 The generator API didn't answer, or answered with a non-2xx.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// 🧩 The generator answered, but not with anything shaped like a user.
    #[error("malformed source response: {0}")]
    MalformedSource(String),

    /// ⏱️ The broker didn't ack within the send timeout.
    #[error("publish timed out after {0:?}")]
    PublishTimeout(Duration),

    /// 📭 The broker said no. Or the broker isn't there to say anything.
    #[error("publish failed: {0}")]
    PublishFailure(String),

    /// 🔤 The message payload isn't UTF-8 JSON.
    #[error("payload could not be deserialized: {0}")]
    Deserialization(String),

    /// 📐 The payload is JSON, just not our JSON.
    #[error("schema violation on field `{field}`: {reason}")]
    SchemaViolation { field: &'static str, reason: String },

    /// 🏛️ The durable store refused the write or never got back to us.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// 📍 Progress could not be written down. Fatal: we would rather stop than guess.
    #[error("checkpoint could not be persisted: {0}")]
    CheckpointPersist(String),
}

impl PipelineError {
    /// 🔄 Producer-side failures cost one tick, nothing more.
    pub fn skips_tick(&self) -> bool {
        matches!(
            self,
            PipelineError::SourceUnavailable(_)
                | PipelineError::MalformedSource(_)
                | PipelineError::PublishTimeout(_)
                | PipelineError::PublishFailure(_)
        )
    }

    /// 🛑 Failures that must end the consumer without touching the checkpoint again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::StoreUnavailable(_) | PipelineError::CheckpointPersist(_)
        )
    }

    /// 🏷️ Short kind label, for log fields and dead-letter lines.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable(_) => "source_unavailable",
            PipelineError::MalformedSource(_) => "malformed_source",
            PipelineError::PublishTimeout(_) => "publish_timeout",
            PipelineError::PublishFailure(_) => "publish_failure",
            PipelineError::Deserialization(_) => "deserialization",
            PipelineError::SchemaViolation { .. } => "schema_violation",
            PipelineError::StoreUnavailable(_) => "store_unavailable",
            PipelineError::CheckpointPersist(_) => "checkpoint_persist",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_every_error_knows_which_bucket_it_lives_in() {
        let tick_skippers = [
            PipelineError::SourceUnavailable("down".into()),
            PipelineError::MalformedSource("no results".into()),
            PipelineError::PublishTimeout(Duration::from_secs(5)),
            PipelineError::PublishFailure("broker gone".into()),
        ];
        for err in &tick_skippers {
            assert!(err.skips_tick(), "{err} should only cost a tick");
            assert!(!err.is_fatal());
        }

        let per_message = [
            PipelineError::Deserialization("not utf-8".into()),
            PipelineError::SchemaViolation {
                field: "email",
                reason: "missing".into(),
            },
        ];
        for err in &per_message {
            assert!(!err.skips_tick(), "{err} belongs to the consumer");
            assert!(!err.is_fatal());
        }

        let fatal = [
            PipelineError::StoreUnavailable("no hosts".into()),
            PipelineError::CheckpointPersist("disk full".into()),
        ];
        for err in &fatal {
            assert!(err.is_fatal(), "{err} should stop the consumer");
            assert!(!err.skips_tick());
        }
    }

    #[test]
    fn the_one_where_schema_violations_name_the_guilty_field() {
        let err = PipelineError::SchemaViolation {
            field: "post_code",
            reason: "expected a string, found a number".into(),
        };
        assert_eq!(
            err.to_string(),
            "schema violation on field `post_code`: expected a string, found a number"
        );
        assert_eq!(err.kind(), "schema_violation");
    }
}
