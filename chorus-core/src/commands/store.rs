use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::model::CommandRecord;
use crate::{error::Result, types::ids::CommandId};

/// Passive persistence for command records. The scheduler is the only
/// writer.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Insert or replace the record with the same id.
    async fn save(&self, record: &CommandRecord) -> Result<()>;

    /// Every stored record, oldest first.
    async fn load_all(&self) -> Result<Vec<CommandRecord>>;

    /// Returns the number of records actually removed.
    async fn delete(&self, ids: &[CommandId]) -> Result<u64>;
}

/// Process-local store used by tests and by deployments without a data
/// directory.
#[derive(Default)]
pub struct InMemoryCommandStore {
    records: Mutex<HashMap<CommandId, CommandRecord>>,
}

impl fmt::Debug for InMemoryCommandStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.records.try_lock().map(|records| records.len()).ok();
        f.debug_struct("InMemoryCommandStore")
            .field("records", &len)
            .finish()
    }
}

impl InMemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store, e.g. with records left behind by a previous run.
    pub fn with_records(records: impl IntoIterator<Item = CommandRecord>) -> Self {
        Self {
            records: Mutex::new(
                records.into_iter().map(|record| (record.id, record)).collect(),
            ),
        }
    }

    pub async fn get(&self, id: CommandId) -> Option<CommandRecord> {
        self.records.lock().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl CommandStore for InMemoryCommandStore {
    async fn save(&self, record: &CommandRecord) -> Result<()> {
        self.records.lock().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<CommandRecord>> {
        let mut records: Vec<CommandRecord> =
            self.records.lock().await.values().cloned().collect();
        records.sort_by_key(|record| (record.queued_at, record.id));
        Ok(records)
    }

    async fn delete(&self, ids: &[CommandId]) -> Result<u64> {
        let mut records = self.records.lock().await;
        let removed = ids
            .iter()
            .filter(|id| records.remove(*id).is_some())
            .count();
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::model::{
        CommandParameters, CommandStatus, CommandTrigger,
    };

    #[tokio::test]
    async fn save_replaces_by_id() {
        let store = InMemoryCommandStore::new();
        let mut record = CommandRecord::queued(
            "RefreshArtist",
            CommandParameters::new(),
            CommandTrigger::Scheduled,
        );
        store.save(&record).await.expect("insert");
        record.status = CommandStatus::Started;
        store.save(&record).await.expect("update");

        let all = store.load_all().await.expect("load");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, CommandStatus::Started);

        assert_eq!(store.delete(&[record.id, CommandId::new()]).await.ok(), Some(1));
        assert!(store.is_empty().await);
    }
}
