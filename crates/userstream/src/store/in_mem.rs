use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::PipelineError;
use crate::record::UserRecord;
use crate::store::UserStore;

/// 📦 A table that never forgets, until the process exits.
///
/// Behaves like the real table where it matters: writes before the schema exists
/// fail, schema creation is idempotent, upserts overwrite whole rows. Clones share
/// one table, so a test can keep a handle after giving one to the sink.
#[derive(Debug, Clone, Default)]
pub(crate) struct InMemoryStore {
    table: Arc<Mutex<Option<BTreeMap<String, UserRecord>>>>,
    schema_creations: Arc<AtomicUsize>,
    upserts: Arc<AtomicUsize>,
    down: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 🔌 Simulate the cluster falling over (or getting back up).
    #[cfg(test)]
    pub(crate) fn set_unavailable(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// 🔢 How many times the table actually got created. Should be one, forever.
    #[cfg(test)]
    pub(crate) fn schema_creations(&self) -> usize {
        self.schema_creations.load(Ordering::SeqCst)
    }

    /// 🔢 Upserts that reached the table, duplicates included.
    #[cfg(test)]
    pub(crate) fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    fn check_up(&self) -> Result<(), PipelineError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(PipelineError::StoreUnavailable(
                "in-memory store is switched off".to_string(),
            ));
        }
        Ok(())
    }
}

fn missing_table() -> PipelineError {
    PipelineError::StoreUnavailable("table does not exist, call ensure_schema first".to_string())
}

#[async_trait]
impl UserStore for InMemoryStore {
    async fn ensure_schema(&self) -> Result<(), PipelineError> {
        self.check_up()?;
        let mut table = self.table.lock().await;
        if table.is_none() {
            *table = Some(BTreeMap::new());
            self.schema_creations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn upsert(&self, record: &UserRecord) -> Result<(), PipelineError> {
        self.check_up()?;
        let mut table = self.table.lock().await;
        let rows = table.as_mut().ok_or_else(missing_table)?;
        rows.insert(record.id.clone(), record.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UserRecord>, PipelineError> {
        self.check_up()?;
        let table = self.table.lock().await;
        let rows = table.as_ref().ok_or_else(missing_table)?;
        Ok(rows.get(id).cloned())
    }

    async fn count(&self) -> Result<u64, PipelineError> {
        self.check_up()?;
        let table = self.table.lock().await;
        let rows = table.as_ref().ok_or_else(missing_table)?;
        Ok(rows.len() as u64)
    }

    async fn first_n(&self, n: usize) -> Result<Vec<UserRecord>, PipelineError> {
        self.check_up()?;
        let table = self.table.lock().await;
        let rows = table.as_ref().ok_or_else(missing_table)?;
        Ok(rows.values().take(n).cloned().collect())
    }
}
