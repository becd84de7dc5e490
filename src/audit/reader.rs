//! Ledger Reader
//!
//! Read-only, cursor-based pagination over a partition's entries.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::audit::entry::{AuditEntry, PartitionId};
use crate::database::{LedgerStore, StoredRecord};
use crate::error::LedgerResult;

pub const DEFAULT_PAGE_LIMIT: usize = 100;
pub const MAX_PAGE_LIMIT: usize = 1000;

/// One page of entries plus the cursor for the next page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPage {
    pub partition_id: PartitionId,
    pub entries: Vec<AuditEntry>,
    /// `after_sequence` for the following page; `None` once the tail is reached
    pub next_cursor: Option<u64>,
}

#[derive(Clone)]
pub struct LedgerReader {
    store: Arc<dyn LedgerStore>,
    max_page_limit: usize,
}

impl LedgerReader {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            max_page_limit: MAX_PAGE_LIMIT,
        }
    }

    pub fn with_max_page_limit(mut self, max_page_limit: usize) -> Self {
        self.max_page_limit = max_page_limit.max(1);
        self
    }

    /// Entries after `after_sequence` in ascending order, at most `limit`.
    ///
    /// An unknown partition or a cursor past the tail yields an empty vector.
    pub async fn read(
        &self,
        partition_id: &PartitionId,
        after_sequence: u64,
        limit: usize,
    ) -> LedgerResult<Vec<AuditEntry>> {
        let limit = limit.min(self.max_page_limit);
        let entries = self.store.read(partition_id, after_sequence, limit).await?;
        debug!(
            "Read {} entries from partition {} after sequence {}",
            entries.len(),
            partition_id,
            after_sequence
        );
        Ok(entries)
    }

    /// Raw page for verification; rows that no longer decode are kept in place
    pub async fn read_records(
        &self,
        partition_id: &PartitionId,
        after_sequence: u64,
        limit: usize,
    ) -> LedgerResult<Vec<StoredRecord>> {
        let limit = limit.min(self.max_page_limit);
        self.store
            .read_records(partition_id, after_sequence, limit)
            .await
    }

    pub async fn page(
        &self,
        partition_id: &PartitionId,
        after_sequence: u64,
        limit: usize,
    ) -> LedgerResult<AuditPage> {
        let limit = limit.min(self.max_page_limit);
        let entries = self.read(partition_id, after_sequence, limit).await?;
        let next_cursor = if limit > 0 && entries.len() == limit {
            entries.last().map(|entry| entry.sequence_number)
        } else {
            None
        };
        Ok(AuditPage {
            partition_id: partition_id.clone(),
            entries,
            next_cursor,
        })
    }

    pub async fn partitions(&self) -> LedgerResult<Vec<PartitionId>> {
        self.store.partitions().await
    }
}
