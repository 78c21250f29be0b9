//! 🏛️ Cassandra, through the scylla driver.
//!
//! CQL `INSERT` is already an upsert, which is the best thing about Cassandra
//! for a pipeline like this one. Schema DDL uses `IF NOT EXISTS` everywhere, so
//! two consumers starting at the same moment both walk away happy.

use std::fmt;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::statement::prepared::PreparedStatement;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::errors::PipelineError;
use crate::record::{FIELD_NAMES, UserRecord};
use crate::store::{StoreConfig, UserStore};

/// 🏛️ A connected session plus the statements it needs.
pub(crate) struct CassandraStore {
    session: Session,
    keyspace: String,
    table: String,
    replication_factor: u32,
    /// 🧊 Prepared on first upsert, after the table is known to exist.
    insert: OnceCell<PreparedStatement>,
}

impl fmt::Debug for CassandraStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CassandraStore")
            .field("keyspace", &self.keyspace)
            .field("table", &self.table)
            .field("replication_factor", &self.replication_factor)
            .finish_non_exhaustive()
    }
}

/// 🔒 Keyspace and table names get spliced into CQL, so they had better be plain identifiers.
fn check_identifier(kind: &str, name: &str) -> Result<()> {
    let mut chars = name.chars();
    let starts_well = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    if !starts_well || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') || name.len() > 48 {
        bail!(
            "💀 {kind} name '{name}' is not a plain CQL identifier. \
             Letters, digits and underscores only, starting with a letter, at most 48 characters."
        );
    }
    Ok(())
}

fn unavailable(action: &str, err: impl fmt::Display) -> PipelineError {
    PipelineError::StoreUnavailable(format!("{action}: {err}"))
}

fn column_list() -> String {
    FIELD_NAMES.join(", ")
}

fn create_keyspace_cql(keyspace: &str, replication_factor: u32) -> String {
    format!(
        "CREATE KEYSPACE IF NOT EXISTS {keyspace} WITH replication = \
         {{'class': 'SimpleStrategy', 'replication_factor': '{replication_factor}'}}"
    )
}

fn create_table_cql(qualified_table: &str) -> String {
    let columns: Vec<String> = FIELD_NAMES
        .iter()
        .map(|name| match *name {
            "id" => "id TEXT PRIMARY KEY".to_string(),
            other => format!("{other} TEXT"),
        })
        .collect();
    format!("CREATE TABLE IF NOT EXISTS {qualified_table} ({})", columns.join(", "))
}

fn insert_cql(qualified_table: &str) -> String {
    let markers = vec!["?"; FIELD_NAMES.len()].join(", ");
    format!("INSERT INTO {qualified_table} ({}) VALUES ({markers})", column_list())
}

impl CassandraStore {
    /// 🔌 Open a session against the configured contact points.
    pub(crate) async fn connect(config: &StoreConfig) -> Result<Self> {
        check_identifier("keyspace", &config.keyspace)?;
        check_identifier("table", &config.table)?;

        let session = SessionBuilder::new()
            .known_nodes(&config.nodes)
            .connection_timeout(config.connect_timeout())
            .build()
            .await
            .with_context(|| {
                format!(
                    "💀 Could not connect to Cassandra at {:?}. Connection refused, or nobody home.",
                    config.nodes
                )
            })?;
        info!("🏛️ Connected to Cassandra at {:?}", config.nodes);

        Ok(Self {
            session,
            keyspace: config.keyspace.clone(),
            table: config.table.clone(),
            replication_factor: config.replication_factor,
            insert: OnceCell::new(),
        })
    }

    fn qualified_table(&self) -> String {
        format!("{}.{}", self.keyspace, self.table)
    }

    async fn prepared_insert(&self) -> Result<&PreparedStatement, PipelineError> {
        self.insert
            .get_or_try_init(|| async {
                self.session
                    .prepare(insert_cql(&self.qualified_table()))
                    .await
                    .map_err(|e| unavailable("preparing insert", e))
            })
            .await
    }
}

#[async_trait]
impl UserStore for CassandraStore {
    async fn ensure_schema(&self) -> Result<(), PipelineError> {
        self.session
            .query_unpaged(create_keyspace_cql(&self.keyspace, self.replication_factor), ())
            .await
            .map_err(|e| unavailable("creating keyspace", e))?;
        self.session
            .query_unpaged(create_table_cql(&self.qualified_table()), ())
            .await
            .map_err(|e| unavailable("creating table", e))?;
        debug!("📐 Schema ready: {}", self.qualified_table());
        Ok(())
    }

    async fn upsert(&self, record: &UserRecord) -> Result<(), PipelineError> {
        let insert = self.prepared_insert().await?;
        self.session
            .execute_unpaged(insert, record)
            .await
            .map_err(|e| unavailable("upserting row", e))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UserRecord>, PipelineError> {
        let cql = format!(
            "SELECT {} FROM {} WHERE id = ?",
            column_list(),
            self.qualified_table()
        );
        self.session
            .query_unpaged(cql, (id,))
            .await
            .map_err(|e| unavailable("reading row", e))?
            .into_rows_result()
            .map_err(|e| unavailable("reading row", e))?
            .maybe_first_row::<UserRecord>()
            .map_err(|e| unavailable("decoding row", e))
    }

    async fn count(&self) -> Result<u64, PipelineError> {
        let cql = format!("SELECT COUNT(*) FROM {}", self.qualified_table());
        let (count,) = self
            .session
            .query_unpaged(cql, ())
            .await
            .map_err(|e| unavailable("counting rows", e))?
            .into_rows_result()
            .map_err(|e| unavailable("counting rows", e))?
            .single_row::<(i64,)>()
            .map_err(|e| unavailable("decoding count", e))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn first_n(&self, n: usize) -> Result<Vec<UserRecord>, PipelineError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let limit = i32::try_from(n).unwrap_or(i32::MAX);
        let cql = format!(
            "SELECT {} FROM {} LIMIT {limit}",
            column_list(),
            self.qualified_table()
        );
        let rows = self
            .session
            .query_unpaged(cql, ())
            .await
            .map_err(|e| unavailable("reading rows", e))?
            .into_rows_result()
            .map_err(|e| unavailable("reading rows", e))?;
        rows.rows::<UserRecord>()
            .map_err(|e| unavailable("decoding rows", e))?
            .map(|row| row.map_err(|e| unavailable("decoding row", e)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_only_plain_identifiers_get_spliced_into_cql() {
        assert!(check_identifier("keyspace", "spark_streams").is_ok());
        assert!(check_identifier("table", "user_stream2").is_ok());
        for bad in ["", "1users", "users; DROP TABLE x", "user-stream", "spaß"] {
            assert!(check_identifier("table", bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(check_identifier("table", &"a".repeat(49)).is_err());
    }

    #[test]
    fn the_one_where_the_ddl_is_idempotent_and_the_insert_is_an_upsert() {
        assert_eq!(
            create_keyspace_cql("spark_streams", 1),
            "CREATE KEYSPACE IF NOT EXISTS spark_streams WITH replication = \
             {'class': 'SimpleStrategy', 'replication_factor': '1'}"
        );
        let table = create_table_cql("spark_streams.user_stream");
        assert!(table.starts_with("CREATE TABLE IF NOT EXISTS spark_streams.user_stream (id TEXT PRIMARY KEY, "));
        assert_eq!(table.matches(" TEXT").count(), 12);
        let insert = insert_cql("spark_streams.user_stream");
        assert!(insert.starts_with("INSERT INTO spark_streams.user_stream (id, first_name, "));
        assert_eq!(insert.matches('?').count(), 12);
    }

    #[tokio::test]
    async fn the_one_where_nobody_is_home_on_9042() {
        let config = StoreConfig {
            nodes: vec!["127.0.0.1:1".to_string()],
            connect_timeout_ms: 200,
            ..StoreConfig::default()
        };
        let err = CassandraStore::connect(&config)
            .await
            .expect_err("💀 connected to port 1?");
        assert!(format!("{err:#}").contains("Could not connect to Cassandra"));
    }
}
