//! 🕳️ The Checkpointed Sink: rows first, bookmark second, no exceptions.
//!
//! 🎬 *[a batch of users arrives. the sink writes them all. it waits for every ack.]*
//! *[only then does it pick up the pen and move the bookmark.]*
//! *[the power goes out. the sink wakes up. it reads the bookmark.]*
//! *[it writes the last batch again. the table does not notice. the table never notices.]*
//!
//! That's the whole trick. Upserts are idempotent, so replaying a batch whose
//! checkpoint never landed is harmless. Checkpointing a batch whose rows never
//! landed would lose users forever. So the order is fixed:
//!
//! 1. de-duplicate the batch by `id`, last occurrence wins
//! 2. upsert everything, concurrently, each write under a timeout
//! 3. only if every write succeeded, advance and persist the checkpoint
//!
//! The sink owns its checkpoint outright and commits through `&mut self`, so two
//! batches can never race each other to the bookmark.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::errors::PipelineError;
use crate::record::UserRecord;
use crate::store::UserStore;

/// 🎛️ How hard the sink leans on the store.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SinkSettings {
    pub(crate) write_concurrency: usize,
    pub(crate) write_timeout: Duration,
}

/// 🕳️ A store and a checkpoint, welded together with an ordering guarantee.
#[derive(Debug)]
pub(crate) struct CheckpointedSink<S, C> {
    store: S,
    checkpoints: C,
    checkpoint: Checkpoint,
    settings: SinkSettings,
}

impl<S: UserStore, C: CheckpointStore> CheckpointedSink<S, C> {
    /// 🚀 Make sure the table exists and find out where we left off.
    ///
    /// A checkpoint written for a different group or topic is refused outright.
    /// Resuming someone else's progress would skip messages we never saw.
    pub(crate) async fn open(
        store: S,
        checkpoints: C,
        group_id: &str,
        topic: &str,
        settings: SinkSettings,
    ) -> Result<Self> {
        store
            .ensure_schema()
            .await
            .context("💀 Could not create the keyspace/table. Is the store reachable?")?;

        let checkpoint = match checkpoints.load().await? {
            Some(saved) if saved.group_id == group_id && saved.topic == topic => {
                info!("📍 Resuming group '{group_id}' on '{topic}' at {:?}", saved.next_offsets);
                saved
            }
            Some(saved) => bail!(
                "💀 The checkpoint belongs to group '{}' on topic '{}', but this consumer is group '{group_id}' on topic '{topic}'. \
                 Point checkpoint.path somewhere else, or fix the config.",
                saved.group_id,
                saved.topic
            ),
            None => {
                info!("🐣 No checkpoint for group '{group_id}' on '{topic}'. Starting fresh.");
                Checkpoint::new(group_id, topic)
            }
        };

        Ok(Self {
            store,
            checkpoints,
            checkpoint,
            settings,
        })
    }

    /// 📍 Where each partition should resume.
    pub(crate) fn resume_positions(&self) -> &BTreeMap<i32, i64> {
        &self.checkpoint.next_offsets
    }

    pub(crate) fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// ✍️ One upsert under the write timeout. Too slow counts as unavailable.
    pub(crate) async fn upsert(&self, record: &UserRecord) -> Result<(), PipelineError> {
        match tokio::time::timeout(self.settings.write_timeout, self.store.upsert(record)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(PipelineError::StoreUnavailable(format!(
                "upsert of '{}' timed out after {:?}",
                record.id, self.settings.write_timeout
            ))),
        }
    }

    /// 📦 Write a batch, then checkpoint it. Returns how many distinct rows were written.
    ///
    /// On any write failure the checkpoint is left exactly where it was and the
    /// error comes back as-is. The batch will be replayed after restart.
    pub(crate) async fn commit_batch(
        &mut self,
        records: Vec<UserRecord>,
        positions: &BTreeMap<i32, i64>,
    ) -> Result<usize, PipelineError> {
        let rows = keep_last_per_id(records);
        let written = rows.len();

        let writes: Vec<_> = rows.iter().map(|record| self.upsert(record)).collect();
        futures::stream::iter(writes)
            .buffer_unordered(self.settings.write_concurrency.max(1))
            .try_collect::<Vec<()>>()
            .await?;
        debug!("✍️ {written} rows acknowledged, moving the bookmark");

        self.advance_checkpoint(positions).await?;
        Ok(written)
    }

    /// ⏩ Merge `positions` into the checkpoint and persist it. Never moves backwards.
    ///
    /// Only call this once the writes it covers are acknowledged; `commit_batch` does.
    pub(crate) async fn advance_checkpoint(
        &mut self,
        positions: &BTreeMap<i32, i64>,
    ) -> Result<(), PipelineError> {
        let mut next = self.checkpoint.clone();
        if !next.advance(positions) {
            return Ok(());
        }
        self.checkpoints.persist(&next).await?;
        self.checkpoint = next;
        Ok(())
    }
}

/// 🔁 Drop earlier versions of a repeated `id`, keeping the last and the original order.
///
/// Concurrent upserts of two versions of one id could land in either order; with
/// only the last version left in the batch, there is nothing to race.
fn keep_last_per_id(records: Vec<UserRecord>) -> Vec<UserRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut kept: Vec<UserRecord> = records
        .into_iter()
        .rev()
        .filter(|record| seen.insert(record.id.clone()))
        .collect();
    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpoint;
    use crate::record::fixtures::user;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;

    fn settings() -> SinkSettings {
        SinkSettings {
            write_concurrency: 4,
            write_timeout: Duration::from_secs(5),
        }
    }

    async fn open(
        store: &InMemoryStore,
        checkpoints: &InMemoryCheckpoint,
    ) -> CheckpointedSink<InMemoryStore, InMemoryCheckpoint> {
        CheckpointedSink::open(store.clone(), checkpoints.clone(), "g", "t", settings())
            .await
            .expect("💀 sink failed to open")
    }

    #[tokio::test]
    async fn the_one_where_rows_land_before_the_bookmark_moves() {
        let store = InMemoryStore::new();
        let checkpoints = InMemoryCheckpoint::new();
        let mut sink = open(&store, &checkpoints).await;

        let written = sink
            .commit_batch(vec![user("a"), user("b")], &BTreeMap::from([(0, 2)]))
            .await
            .expect("💀 commit failed");

        assert_eq!(written, 2);
        assert_eq!(store.count().await.expect("💀 count failed"), 2);
        let saved = checkpoints.saved().await.expect("💀 nothing checkpointed");
        assert_eq!(saved.next_offsets, BTreeMap::from([(0, 2)]));
        assert_eq!(sink.resume_positions(), &BTreeMap::from([(0, 2)]));
    }

    #[tokio::test]
    async fn the_one_where_a_commit_runs_on_its_own_task() {
        let store = InMemoryStore::new();
        let checkpoints = InMemoryCheckpoint::new();
        let mut sink = open(&store, &checkpoints).await;

        // The consumer commits from a spawned task, so the commit future must be Send.
        let written = tokio::spawn(async move {
            sink.commit_batch(vec![user("a"), user("b"), user("c")], &BTreeMap::from([(1, 3)]))
                .await
        })
        .await
        .expect("💀 commit task panicked")
        .expect("💀 commit failed");

        assert_eq!(written, 3);
        assert_eq!(store.count().await.expect("💀 count failed"), 3);
        assert_eq!(
            checkpoints.saved().await.expect("💀 nothing checkpointed").next_offsets,
            BTreeMap::from([(1, 3)])
        );
    }

    #[tokio::test]
    async fn the_one_where_a_failed_write_leaves_the_bookmark_alone() {
        let store = InMemoryStore::new();
        let checkpoints = InMemoryCheckpoint::new();
        let mut sink = open(&store, &checkpoints).await;
        store.set_unavailable(true);

        let err = sink
            .commit_batch(vec![user("a")], &BTreeMap::from([(0, 1)]))
            .await
            .expect_err("💀 commit succeeded against a dead store");

        assert!(matches!(err, PipelineError::StoreUnavailable(_)));
        assert_eq!(checkpoints.persist_count(), 0);
        assert_eq!(checkpoints.saved().await, None);
        assert!(sink.resume_positions().is_empty());
    }

    #[tokio::test]
    async fn the_one_where_a_crash_before_the_checkpoint_replays_to_the_same_rows() {
        let store = InMemoryStore::new();
        let checkpoints = InMemoryCheckpoint::new();
        let batch = vec![user("a"), user("b"), user("c")];
        let positions = BTreeMap::from([(0, 3)]);

        // First life: rows go in, then the checkpoint write dies.
        let mut first = open(&store, &checkpoints).await;
        checkpoints.refuse_persists(true);
        let err = first
            .commit_batch(batch.clone(), &positions)
            .await
            .expect_err("💀 checkpoint persist should have failed");
        assert!(matches!(err, PipelineError::CheckpointPersist(_)));
        let after_crash = store.first_n(10).await.expect("💀 read failed");
        drop(first);

        // Second life: nothing was checkpointed, so the same batch comes around again.
        checkpoints.refuse_persists(false);
        let mut second = open(&store, &checkpoints).await;
        assert!(second.resume_positions().is_empty(), "resume should start from scratch");
        second
            .commit_batch(batch, &positions)
            .await
            .expect("💀 replay failed");

        assert_eq!(store.first_n(10).await.expect("💀 read failed"), after_crash);
        assert_eq!(store.count().await.expect("💀 count failed"), 3);
        assert_eq!(
            checkpoints.saved().await.expect("💀 no checkpoint").next_offsets,
            positions
        );
    }

    #[tokio::test]
    async fn the_one_where_the_last_version_of_an_id_wins_inside_a_batch() {
        let store = InMemoryStore::new();
        let checkpoints = InMemoryCheckpoint::new();
        let mut sink = open(&store, &checkpoints).await;

        let mut newer = user("dup");
        newer.phone = "555-0199".into();
        let written = sink
            .commit_batch(vec![user("dup"), user("other"), newer.clone()], &BTreeMap::from([(0, 3)]))
            .await
            .expect("💀 commit failed");

        assert_eq!(written, 2);
        assert_eq!(store.upsert_count(), 2);
        assert_eq!(store.get("dup").await.expect("💀 get failed"), Some(newer));
    }

    #[tokio::test]
    async fn the_one_where_an_old_position_never_rewinds_the_bookmark() {
        let store = InMemoryStore::new();
        let checkpoints = InMemoryCheckpoint::new();
        let mut sink = open(&store, &checkpoints).await;

        sink.advance_checkpoint(&BTreeMap::from([(0, 10)]))
            .await
            .expect("💀 advance failed");
        sink.advance_checkpoint(&BTreeMap::from([(0, 4)]))
            .await
            .expect("💀 advance failed");

        assert_eq!(sink.checkpoint().next_offsets, BTreeMap::from([(0, 10)]));
        assert_eq!(checkpoints.persist_count(), 1, "a no-op advance should not write");
    }

    #[tokio::test]
    async fn the_one_where_someone_elses_checkpoint_is_refused() {
        let store = InMemoryStore::new();
        let mut checkpoints = InMemoryCheckpoint::new();
        checkpoints
            .persist(&Checkpoint::new("another-group", "t"))
            .await
            .expect("💀 seed failed");

        let err = CheckpointedSink::open(store, checkpoints, "g", "t", settings())
            .await
            .expect_err("💀 resumed a different group's progress");
        assert!(err.to_string().contains("another-group"));
    }

    #[derive(Debug)]
    struct SlowStore;

    #[async_trait]
    impl UserStore for SlowStore {
        async fn ensure_schema(&self) -> Result<(), PipelineError> {
            Ok(())
        }
        async fn upsert(&self, _record: &UserRecord) -> Result<(), PipelineError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
        async fn get(&self, _id: &str) -> Result<Option<UserRecord>, PipelineError> {
            Ok(None)
        }
        async fn count(&self) -> Result<u64, PipelineError> {
            Ok(0)
        }
        async fn first_n(&self, _n: usize) -> Result<Vec<UserRecord>, PipelineError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn the_one_where_a_write_that_never_returns_is_unavailable() {
        let checkpoints = InMemoryCheckpoint::new();
        let mut sink = CheckpointedSink::open(
            SlowStore,
            checkpoints.clone(),
            "g",
            "t",
            SinkSettings {
                write_concurrency: 1,
                write_timeout: Duration::from_millis(20),
            },
        )
        .await
        .expect("💀 open failed");

        let err = sink
            .commit_batch(vec![user("slow")], &BTreeMap::from([(0, 1)]))
            .await
            .expect_err("💀 a hung write should time out");
        assert!(matches!(err, PipelineError::StoreUnavailable(_)));
        assert_eq!(checkpoints.persist_count(), 0);
    }
}
