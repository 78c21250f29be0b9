//! 🏛️ The Store: where users finally stop moving and settle down.
//!
//! One table, keyed by `id`, twelve text columns. Every write is a full-row
//! upsert, so writing the same record twice is the same as writing it once.
//! That single property is what lets the consumer replay after a crash without
//! a care in the world. 🦆
//!
//! Cassandra is the real thing. The in-memory store is a `BTreeMap` with a
//! kill switch, for tests and demos.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::PipelineError;
use crate::record::UserRecord;

mod cassandra;
mod in_mem;

pub(crate) use cassandra::CassandraStore;
pub(crate) use in_mem::InMemoryStore;

/// 🔧 Where the cluster is and what to call things once we get there.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// 📡 Contact points, `host:port`.
    #[serde(default = "default_nodes")]
    pub nodes: Vec<String>,
    #[serde(default = "default_keyspace")]
    pub keyspace: String,
    #[serde(default = "default_table")]
    pub table: String,
    /// 🧬 SimpleStrategy replication factor, used only when the keyspace gets created.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_nodes() -> Vec<String> {
    vec!["127.0.0.1:9042".to_string()]
}

fn default_keyspace() -> String {
    "spark_streams".to_string()
}

fn default_table() -> String {
    "user_stream".to_string()
}

fn default_replication_factor() -> u32 {
    1
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            keyspace: default_keyspace(),
            table: default_table(),
            replication_factor: default_replication_factor(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// ===== UserStore Trait and Backend Enum =====

/// 🏛️ The durable table of users.
///
/// # Contract 📜
/// - `ensure_schema` creates keyspace and table if missing. Safe to race: concurrent
///   callers all succeed and exactly one table exists afterwards.
/// - `upsert` overwrites the whole row for `record.id`. Idempotent.
/// - `get` of an absent id is `Ok(None)`, not an error.
/// - Every failure to reach or use the store is [`PipelineError::StoreUnavailable`].
///
/// Methods take `&self` so one store can serve many concurrent upserts.
#[async_trait]
pub(crate) trait UserStore: std::fmt::Debug + Send + Sync {
    async fn ensure_schema(&self) -> Result<(), PipelineError>;
    async fn upsert(&self, record: &UserRecord) -> Result<(), PipelineError>;
    async fn get(&self, id: &str) -> Result<Option<UserRecord>, PipelineError>;
    async fn count(&self) -> Result<u64, PipelineError>;
    /// 👀 Up to `n` rows, in whatever order the store likes.
    async fn first_n(&self, n: usize) -> Result<Vec<UserRecord>, PipelineError>;
}

/// 🎭 The many faces of a UserStore.
#[derive(Debug)]
pub(crate) enum StoreBackend {
    Cassandra(CassandraStore),
    InMemory(InMemoryStore),
}

impl StoreBackend {
    /// 🏗️ Connect to whatever the config points at.
    pub(crate) async fn from_config(config: &StoreConfig) -> Result<Self> {
        Ok(StoreBackend::Cassandra(CassandraStore::connect(config).await?))
    }
}

#[async_trait]
impl UserStore for StoreBackend {
    async fn ensure_schema(&self) -> Result<(), PipelineError> {
        match self {
            StoreBackend::Cassandra(store) => store.ensure_schema().await,
            StoreBackend::InMemory(store) => store.ensure_schema().await,
        }
    }

    async fn upsert(&self, record: &UserRecord) -> Result<(), PipelineError> {
        match self {
            StoreBackend::Cassandra(store) => store.upsert(record).await,
            StoreBackend::InMemory(store) => store.upsert(record).await,
        }
    }

    async fn get(&self, id: &str) -> Result<Option<UserRecord>, PipelineError> {
        match self {
            StoreBackend::Cassandra(store) => store.get(id).await,
            StoreBackend::InMemory(store) => store.get(id).await,
        }
    }

    async fn count(&self) -> Result<u64, PipelineError> {
        match self {
            StoreBackend::Cassandra(store) => store.count().await,
            StoreBackend::InMemory(store) => store.count().await,
        }
    }

    async fn first_n(&self, n: usize) -> Result<Vec<UserRecord>, PipelineError> {
        match self {
            StoreBackend::Cassandra(store) => store.first_n(n).await,
            StoreBackend::InMemory(store) => store.first_n(n).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::user;

    #[tokio::test]
    async fn the_one_where_the_enum_forwards_every_call() {
        let store = StoreBackend::InMemory(InMemoryStore::new());
        store.ensure_schema().await.expect("💀 schema failed");
        store.upsert(&user("a")).await.expect("💀 upsert failed");
        store.upsert(&user("b")).await.expect("💀 upsert failed");

        assert_eq!(store.count().await.expect("💀 count failed"), 2);
        assert_eq!(store.get("a").await.expect("💀 get failed"), Some(user("a")));
        assert_eq!(store.get("nobody").await.expect("💀 get failed"), None);
        assert_eq!(store.first_n(1).await.expect("💀 first_n failed").len(), 1);
    }

    #[test]
    fn the_one_where_store_defaults_match_the_docker_compose_world() {
        let config = StoreConfig::default();
        assert_eq!(config.keyspace, "spark_streams");
        assert_eq!(config.table, "user_stream");
        assert_eq!(config.replication_factor, 1);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
    }
}
