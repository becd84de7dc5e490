//! Ledger Writer
//!
//! The single append path. Every collaborator records its state changes
//! through [`LedgerWriter::record`]; nothing else creates entries.

use anyhow::{anyhow, Context};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::audit::entry::{AuditEntry, AuditEvent, PartitionId};
use crate::audit::hasher::HashAlgorithm;
use crate::audit::sequencer::Sequencer;
use crate::database::LedgerStore;
use crate::error::LedgerResult;

pub const DEFAULT_MAX_APPEND_RETRIES: u32 = 3;

pub struct LedgerWriter {
    store: Arc<dyn LedgerStore>,
    sequencer: Sequencer,
    algorithm: HashAlgorithm,
    max_retries: u32,
}

impl LedgerWriter {
    pub fn new(store: Arc<dyn LedgerStore>, algorithm: HashAlgorithm) -> Self {
        Self {
            sequencer: Sequencer::new(store.clone(), algorithm),
            store,
            algorithm,
            max_retries: DEFAULT_MAX_APPEND_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Last persisted sequence number of a partition
    pub async fn current_sequence(&self, partition_id: &PartitionId) -> LedgerResult<Option<u64>> {
        self.sequencer.current(partition_id).await
    }

    /// Construct, commit and durably append one entry.
    ///
    /// Fails with [`crate::LedgerError::Conflict`] when another writer extended
    /// the partition first, and with `Persistence` when the store
    /// rejects the write. In both cases no sequence number is consumed.
    pub async fn record(&self, event: AuditEvent) -> LedgerResult<AuditEntry> {
        event.validate()?;
        let slot = self.sequencer.next(&event.partition_id).await?;

        let entry = AuditEntry::seal(
            event,
            slot.sequence_number(),
            slot.previous_commitment().clone(),
            slot.timestamp(Utc::now()),
            self.algorithm,
        )?;

        match self.store.append(&entry).await {
            Ok(()) => {
                slot.commit(&entry);
                debug!("Appended audit entry: {}", entry.summary());
                Ok(entry)
            }
            Err(e) => {
                // The store may or may not hold the row; reload the head next time.
                slot.invalidate();
                if e.is_conflict() {
                    warn!("Append conflict for {}: {}", entry.summary(), e);
                } else {
                    error!("Failed to persist audit entry {}: {}", entry.summary(), e);
                }
                Err(e)
            }
        }
    }

    /// [`LedgerWriter::record`], retrying against the new tail on conflict
    pub async fn record_with_retry(&self, event: AuditEvent) -> LedgerResult<AuditEntry> {
        let mut attempt = 0;
        loop {
            match self.record(event.clone()).await {
                Err(e) if e.is_conflict() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "Retrying append to partition {} (attempt {} of {})",
                        event.partition_id, attempt, self.max_retries
                    );
                }
                result => return result,
            }
        }
    }

    /// Run a business operation and record its audit entry.
    ///
    /// The operation only counts as successful when the audit append also
    /// succeeds; an append failure is returned as an error so the caller can
    /// fail or compensate the operation.
    pub async fn execute_with_audit<F, Fut, T, E>(
        &self,
        event: AuditEvent,
        operation: F,
    ) -> anyhow::Result<(T, AuditEntry)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let summary = format!("{} {}:{}", event.action, event.entity_type, event.entity_id);
        let result = operation()
            .await
            .map_err(|e| anyhow!("Operation {} failed: {}", summary, e))?;

        let entry = self
            .record_with_retry(event)
            .await
            .with_context(|| {
                format!("Operation {} completed but its audit entry was not recorded", summary)
            })?;

        Ok((result, entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{ActorId, AuditAction};
    use crate::audit::hasher::Commitment;
    use crate::database::MemoryLedgerStore;
    use crate::error::LedgerError;
    use serde_json::json;

    fn event(partition: &str, action: AuditAction) -> AuditEvent {
        AuditEvent::new(
            PartitionId::new(partition).unwrap(),
            ActorId::principal("user-1").unwrap(),
            action,
            "risk",
            "RSK-001",
        )
        .with_after(json!({"title": "Phishing"}))
    }

    fn writer() -> (Arc<MemoryLedgerStore>, LedgerWriter) {
        let store = Arc::new(MemoryLedgerStore::new());
        let writer = LedgerWriter::new(store.clone(), HashAlgorithm::Sha256);
        (store, writer)
    }

    #[tokio::test]
    async fn test_record_builds_chain() {
        let (_, writer) = writer();
        let a = writer.record(event("P1", AuditAction::Create)).await.unwrap();
        let b = writer.record(event("P1", AuditAction::Update)).await.unwrap();
        let c = writer.record(event("P1", AuditAction::StatusChange)).await.unwrap();

        assert_eq!((a.sequence_number, b.sequence_number, c.sequence_number), (1, 2, 3));
        assert_eq!(a.previous_commitment, Commitment::genesis(HashAlgorithm::Sha256));
        assert_eq!(b.previous_commitment, a.commitment);
        assert_eq!(c.previous_commitment, b.commitment);
        assert!(a.created_at <= b.created_at && b.created_at <= c.created_at);
        assert_eq!(writer.current_sequence(&a.partition_id).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_partitions_are_chained_independently() {
        let (_, writer) = writer();
        let a = writer.record(event("org-a", AuditAction::Create)).await.unwrap();
        let b = writer.record(event("org-b", AuditAction::Create)).await.unwrap();
        assert_eq!(a.sequence_number, 1);
        assert_eq!(b.sequence_number, 1);
        assert_eq!(a.previous_commitment, b.previous_commitment);
    }

    #[tokio::test]
    async fn test_invalid_event_is_rejected_without_consuming_sequence() {
        let (_, writer) = writer();
        let mut bad = event("P1", AuditAction::Create);
        bad.entity_type = String::new();
        assert!(matches!(writer.record(bad).await, Err(LedgerError::InvalidInput(_))));

        let entry = writer.record(event("P1", AuditAction::Create)).await.unwrap();
        assert_eq!(entry.sequence_number, 1);
    }

    #[tokio::test]
    async fn test_stale_writer_gets_conflict_then_retries() {
        let (store, first) = writer();
        let second = LedgerWriter::new(store.clone(), HashAlgorithm::Sha256);

        first.record(event("P1", AuditAction::Create)).await.unwrap();
        second.record(event("P1", AuditAction::Update)).await.unwrap();

        let err = first.record(event("P1", AuditAction::Delete)).await.unwrap_err();
        assert!(err.is_conflict());

        second.record(event("P1", AuditAction::Link)).await.unwrap();
        let entry = first
            .record_with_retry(event("P1", AuditAction::Delete))
            .await
            .unwrap();
        assert_eq!(entry.sequence_number, 4);
        assert_eq!(store.len(&entry.partition_id).await, 4);
    }

    #[tokio::test]
    async fn test_execute_with_audit() {
        let (store, writer) = writer();
        let (value, entry) = writer
            .execute_with_audit(event("P1", AuditAction::Create), || async {
                Ok::<_, String>(42)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(entry.sequence_number, 1);

        let failed = writer
            .execute_with_audit(event("P1", AuditAction::Update), || async {
                Err::<(), _>("validation failed")
            })
            .await;
        assert!(failed.is_err());
        assert_eq!(store.len(&entry.partition_id).await, 1);
    }
}
