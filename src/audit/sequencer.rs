//! Per-partition sequence allocation.
//!
//! Each partition has its own async mutex guarding a cached [`ChainHead`].
//! A [`SequenceSlot`] holds that mutex from allocation until the append is
//! committed or abandoned, so appends within a partition are linearizable while
//! different partitions never wait on each other.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::audit::entry::{AuditEntry, ChainHead, PartitionId};
use crate::audit::hasher::{Commitment, HashAlgorithm};
use crate::database::LedgerStore;
use crate::error::LedgerResult;

#[derive(Debug, Default)]
struct PartitionState {
    // None until loaded from the store; reset after a failed append.
    head: Option<Option<ChainHead>>,
}

/// Lock entries are created on first use of a partition and kept until
/// [`Sequencer::prune_idle`] removes them, so memory grows with the number of
/// partitions touched.
pub struct Sequencer {
    store: Arc<dyn LedgerStore>,
    algorithm: HashAlgorithm,
    partitions: Mutex<HashMap<PartitionId, Arc<Mutex<PartitionState>>>>,
}

impl Sequencer {
    pub fn new(store: Arc<dyn LedgerStore>, algorithm: HashAlgorithm) -> Self {
        Self {
            store,
            algorithm,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    async fn partition_lock(&self, partition_id: &PartitionId) -> Arc<Mutex<PartitionState>> {
        let mut partitions = self.partitions.lock().await;
        partitions
            .entry(partition_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(PartitionState::default())))
            .clone()
    }

    async fn lock_loaded(
        &self,
        partition_id: &PartitionId,
    ) -> LedgerResult<OwnedMutexGuard<PartitionState>> {
        let mut guard = self.partition_lock(partition_id).await.lock_owned().await;
        if guard.head.is_none() {
            let head = self.store.head(partition_id).await?;
            debug!(
                "Loaded head for partition {}: {:?}",
                partition_id,
                head.as_ref().map(|h| h.sequence_number)
            );
            guard.head = Some(head);
        }
        Ok(guard)
    }

    /// Allocate the next sequence number for `partition_id`.
    ///
    /// The returned slot holds the partition until it is committed or dropped;
    /// concurrent callers for the same partition wait here.
    pub async fn next(&self, partition_id: &PartitionId) -> LedgerResult<SequenceSlot> {
        let guard = self.lock_loaded(partition_id).await?;
        let head = guard.head.as_ref().and_then(Option::as_ref);
        let (sequence_number, previous_commitment, previous_created_at) = match head {
            Some(head) => (
                head.sequence_number + 1,
                head.commitment.clone(),
                Some(head.created_at),
            ),
            None => (1, Commitment::genesis(self.algorithm), None),
        };

        Ok(SequenceSlot {
            guard,
            committed: false,
            partition_id: partition_id.clone(),
            sequence_number,
            previous_commitment,
            previous_created_at,
        })
    }

    /// Forget partitions nobody is appending to; their heads reload on next use.
    /// Returns how many were removed.
    pub async fn prune_idle(&self) -> usize {
        let mut partitions = self.partitions.lock().await;
        let before = partitions.len();
        // Callers clone the Arc under the map lock, so a count of 1 means idle.
        partitions.retain(|_, state| Arc::strong_count(state) > 1);
        let pruned = before - partitions.len();
        if pruned > 0 {
            debug!("Pruned {} idle partition locks", pruned);
        }
        pruned
    }

    /// Last persisted sequence number, or `None` for an empty partition
    pub async fn current(&self, partition_id: &PartitionId) -> LedgerResult<Option<u64>> {
        let guard = self.lock_loaded(partition_id).await?;
        Ok(guard
            .head
            .as_ref()
            .and_then(Option::as_ref)
            .map(|head| head.sequence_number))
    }
}

/// A reserved chain position.
///
/// Dropping the slot without [`SequenceSlot::commit`] releases the number and
/// forces the next caller to reload the head from the store, which covers an
/// append cancelled after the store already accepted it.
pub struct SequenceSlot {
    guard: OwnedMutexGuard<PartitionState>,
    committed: bool,
    partition_id: PartitionId,
    sequence_number: u64,
    previous_commitment: Commitment,
    previous_created_at: Option<DateTime<Utc>>,
}

impl SequenceSlot {
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn previous_commitment(&self) -> &Commitment {
        &self.previous_commitment
    }

    /// Timestamp for the new entry, never earlier than its predecessor's
    pub fn timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.previous_created_at {
            Some(previous) if previous > now => previous,
            _ => now,
        }
    }

    /// Advance the partition head to the persisted `entry`
    pub fn commit(mut self, entry: &AuditEntry) {
        self.guard.head = Some(Some(entry.head()));
        self.committed = true;
    }

    /// Forget the cached head so the next caller reloads it from the store
    pub fn invalidate(self) {
        drop(self);
    }
}

impl Drop for SequenceSlot {
    fn drop(&mut self) {
        if !self.committed {
            warn!(
                "Releasing sequence {} of partition {} without an append",
                self.sequence_number, self.partition_id
            );
            self.guard.head = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{ActorId, AuditAction, AuditEvent};
    use crate::database::MemoryLedgerStore;

    fn sequencer() -> (Arc<MemoryLedgerStore>, Sequencer) {
        let store = Arc::new(MemoryLedgerStore::new());
        let sequencer = Sequencer::new(store.clone(), HashAlgorithm::Sha256);
        (store, sequencer)
    }

    fn sealed(slot: &SequenceSlot, partition: &PartitionId) -> AuditEntry {
        let event = AuditEvent::new(
            partition.clone(),
            ActorId::System,
            AuditAction::Create,
            "risk",
            "RSK-1",
        );
        AuditEntry::seal(
            event,
            slot.sequence_number(),
            slot.previous_commitment().clone(),
            slot.timestamp(Utc::now()),
            HashAlgorithm::Sha256,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_first_slot_starts_at_genesis() {
        let (_, sequencer) = sequencer();
        let partition = PartitionId::new("org-1").unwrap();
        assert_eq!(sequencer.current(&partition).await.unwrap(), None);

        let slot = sequencer.next(&partition).await.unwrap();
        assert_eq!(slot.sequence_number(), 1);
        assert_eq!(slot.previous_commitment(), &Commitment::genesis(HashAlgorithm::Sha256));
    }

    #[tokio::test]
    async fn test_dropped_slot_releases_number() {
        let (_, sequencer) = sequencer();
        let partition = PartitionId::new("org-1").unwrap();

        let slot = sequencer.next(&partition).await.unwrap();
        assert_eq!(slot.sequence_number(), 1);
        drop(slot);

        let slot = sequencer.next(&partition).await.unwrap();
        assert_eq!(slot.sequence_number(), 1);
    }

    #[tokio::test]
    async fn test_commit_advances_head() {
        let (store, sequencer) = sequencer();
        let partition = PartitionId::new("org-1").unwrap();

        let slot = sequencer.next(&partition).await.unwrap();
        let entry = sealed(&slot, &partition);
        store.append(&entry).await.unwrap();
        slot.commit(&entry);

        assert_eq!(sequencer.current(&partition).await.unwrap(), Some(1));
        let slot = sequencer.next(&partition).await.unwrap();
        assert_eq!(slot.sequence_number(), 2);
        assert_eq!(slot.previous_commitment(), &entry.commitment);
    }

    #[tokio::test]
    async fn test_invalidate_reloads_from_store() {
        let (store, sequencer) = sequencer();
        let partition = PartitionId::new("org-1").unwrap();

        // Another writer appends behind the sequencer's back.
        let other = Sequencer::new(store.clone(), HashAlgorithm::Sha256);
        assert_eq!(sequencer.current(&partition).await.unwrap(), None);
        let slot = other.next(&partition).await.unwrap();
        let entry = sealed(&slot, &partition);
        store.append(&entry).await.unwrap();
        slot.commit(&entry);

        let stale = sequencer.next(&partition).await.unwrap();
        assert_eq!(stale.sequence_number(), 1);
        stale.invalidate();

        let fresh = sequencer.next(&partition).await.unwrap();
        assert_eq!(fresh.sequence_number(), 2);
    }

    #[tokio::test]
    async fn test_partitions_do_not_block_each_other() {
        let (_, sequencer) = sequencer();
        let a = PartitionId::new("org-a").unwrap();
        let b = PartitionId::new("org-b").unwrap();

        let held = sequencer.next(&a).await.unwrap();
        let other = tokio::time::timeout(std::time::Duration::from_secs(1), sequencer.next(&b))
            .await
            .expect("partition b must not wait on partition a")
            .unwrap();
        assert_eq!(held.sequence_number(), 1);
        assert_eq!(other.sequence_number(), 1);
    }

    #[tokio::test]
    async fn test_prune_idle_keeps_held_partitions() {
        let (store, sequencer) = sequencer();
        let a = PartitionId::new("org-a").unwrap();
        let b = PartitionId::new("org-b").unwrap();

        let slot = sequencer.next(&a).await.unwrap();
        let entry = sealed(&slot, &a);
        store.append(&entry).await.unwrap();
        assert_eq!(sequencer.current(&b).await.unwrap(), None);

        assert_eq!(sequencer.prune_idle().await, 1);
        slot.commit(&entry);
        assert_eq!(sequencer.prune_idle().await, 1);
        assert_eq!(sequencer.prune_idle().await, 0);

        // A pruned partition reloads its head from the store.
        let slot = sequencer.next(&a).await.unwrap();
        assert_eq!(slot.sequence_number(), 2);
        assert_eq!(slot.previous_commitment(), &entry.commitment);
    }

    #[tokio::test]
    async fn test_timestamp_is_monotonic() {
        let (store, sequencer) = sequencer();
        let partition = PartitionId::new("org-1").unwrap();
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(5);

        let slot = sequencer.next(&partition).await.unwrap();
        let event =
            AuditEvent::new(partition.clone(), ActorId::System, AuditAction::Create, "risk", "R");
        let entry = AuditEntry::seal(
            event,
            1,
            slot.previous_commitment().clone(),
            later,
            HashAlgorithm::Sha256,
        )
        .unwrap();
        store.append(&entry).await.unwrap();
        slot.commit(&entry);

        let slot = sequencer.next(&partition).await.unwrap();
        assert_eq!(slot.timestamp(now), entry.created_at);
        let much_later = later + chrono::Duration::seconds(1);
        assert_eq!(slot.timestamp(much_later), much_later);
    }
}
