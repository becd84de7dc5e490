//! In-process ledger store, for tests and embedding.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::audit::entry::{AuditEntry, ChainHead, PartitionId};
use crate::database::{check_extends, LedgerStore};
use crate::error::LedgerResult;

#[derive(Default)]
pub struct MemoryLedgerStore {
    partitions: RwLock<HashMap<PartitionId, Vec<AuditEntry>>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, partition_id: &PartitionId) -> usize {
        self.partitions
            .read()
            .await
            .get(partition_id)
            .map_or(0, Vec::len)
    }

    /// Direct access to stored rows, bypassing the append-only contract.
    #[cfg(test)]
    pub(crate) async fn tamper<F>(&self, partition_id: &PartitionId, f: F)
    where
        F: FnOnce(&mut Vec<AuditEntry>),
    {
        let mut partitions = self.partitions.write().await;
        f(partitions.entry(partition_id.clone()).or_default());
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn head(&self, partition_id: &PartitionId) -> LedgerResult<Option<ChainHead>> {
        Ok(self
            .partitions
            .read()
            .await
            .get(partition_id)
            .and_then(|entries| entries.last())
            .map(AuditEntry::head))
    }

    async fn append(&self, entry: &AuditEntry) -> LedgerResult<()> {
        let mut partitions = self.partitions.write().await;
        let entries = partitions.entry(entry.partition_id.clone()).or_default();
        let head = entries.last().map(AuditEntry::head);
        check_extends(entry, head.as_ref())?;
        entries.push(entry.clone());
        Ok(())
    }

    async fn read(
        &self,
        partition_id: &PartitionId,
        after_sequence: u64,
        limit: usize,
    ) -> LedgerResult<Vec<AuditEntry>> {
        let partitions = self.partitions.read().await;
        let Some(entries) = partitions.get(partition_id) else {
            return Ok(Vec::new());
        };
        // Stable sort keeps duplicated positions in insertion order.
        let mut page: Vec<AuditEntry> = entries
            .iter()
            .filter(|entry| entry.sequence_number > after_sequence)
            .cloned()
            .collect();
        page.sort_by_key(|entry| entry.sequence_number);
        page.truncate(limit);
        Ok(page)
    }

    async fn partitions(&self) -> LedgerResult<Vec<PartitionId>> {
        let mut ids: Vec<PartitionId> = self
            .partitions
            .read()
            .await
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
