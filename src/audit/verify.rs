//! Chain Verification
//!
//! Replays a partition in sequence order, recomputing every commitment and
//! checking contiguity and linkage. Verification stops at the first break and
//! never repairs anything.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info};

use crate::audit::entry::{AuditEntry, PartitionId};
use crate::audit::hasher::{Commitment, HashAlgorithm};
use crate::audit::reader::LedgerReader;
use crate::database::StoredRecord;
use crate::error::{LedgerError, LedgerResult};

pub const DEFAULT_VERIFY_BATCH_SIZE: usize = 500;

/// Why a chain is considered broken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakReason {
    SequenceGap,
    SequenceDuplicate,
    BrokenLink,
    ContentMismatch,
}

impl fmt::Display for BreakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SequenceGap => "sequence-gap",
            Self::SequenceDuplicate => "sequence-duplicate",
            Self::BrokenLink => "broken-link",
            Self::ContentMismatch => "content-mismatch",
        };
        f.write_str(s)
    }
}

/// First break found while replaying a chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    pub sequence: u64,
    pub reason: BreakReason,
    pub detail: String,
}

/// Incremental chain checker; feed entries in the order the store returns them
#[derive(Debug, Clone)]
pub struct ChainCursor {
    partition_id: PartitionId,
    algorithm: HashAlgorithm,
    expected_sequence: u64,
    expected_previous: Commitment,
}

impl ChainCursor {
    pub fn new(partition_id: PartitionId, algorithm: HashAlgorithm) -> Self {
        Self {
            partition_id,
            algorithm,
            expected_sequence: 1,
            expected_previous: Commitment::genesis(algorithm),
        }
    }

    /// Number of entries accepted so far
    pub fn checked(&self) -> u64 {
        self.expected_sequence - 1
    }

    /// Commitment of the last accepted entry (genesis before any)
    pub fn head(&self) -> &Commitment {
        &self.expected_previous
    }

    pub fn check(&mut self, entry: &AuditEntry) -> Result<(), ChainBreak> {
        let sequence = entry.sequence_number;
        self.check_sequence(sequence)?;

        if entry.previous_commitment != self.expected_previous {
            return Err(ChainBreak {
                sequence,
                reason: BreakReason::BrokenLink,
                detail: format!(
                    "previous commitment {} does not match {}",
                    entry.previous_commitment, self.expected_previous
                ),
            });
        }
        if entry.partition_id != self.partition_id {
            return Err(ChainBreak {
                sequence,
                reason: BreakReason::ContentMismatch,
                detail: format!(
                    "entry belongs to partition {}, not {}",
                    entry.partition_id, self.partition_id
                ),
            });
        }
        if !entry.verify_commitment(self.algorithm) {
            return Err(ChainBreak {
                sequence,
                reason: BreakReason::ContentMismatch,
                detail: format!("stored commitment {} does not match content", entry.commitment),
            });
        }

        self.expected_previous = entry.commitment.clone();
        self.expected_sequence += 1;
        Ok(())
    }

    /// Check a stored record; an undecodable row is a content mismatch at its position
    pub fn check_record(&mut self, record: &StoredRecord) -> Result<(), ChainBreak> {
        match record {
            StoredRecord::Entry(entry) => self.check(entry),
            StoredRecord::Undecodable {
                sequence_number,
                detail,
            } => {
                self.check_sequence(*sequence_number)?;
                Err(ChainBreak {
                    sequence: *sequence_number,
                    reason: BreakReason::ContentMismatch,
                    detail: format!("stored row no longer decodes: {}", detail),
                })
            }
        }
    }

    fn check_sequence(&self, sequence: u64) -> Result<(), ChainBreak> {
        if sequence < self.expected_sequence {
            return Err(ChainBreak {
                sequence,
                reason: BreakReason::SequenceDuplicate,
                detail: format!(
                    "sequence {} repeated, expected {}",
                    sequence, self.expected_sequence
                ),
            });
        }
        if sequence > self.expected_sequence {
            return Err(ChainBreak {
                sequence,
                reason: BreakReason::SequenceGap,
                detail: format!(
                    "expected sequence {}, found {}",
                    self.expected_sequence, sequence
                ),
            });
        }
        Ok(())
    }
}

/// Verification result with detailed information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub partition_id: PartitionId,
    pub ok: bool,
    pub entries_checked: u64,
    pub first_broken_sequence: Option<u64>,
    pub reason: Option<BreakReason>,
    pub detail: Option<String>,
    /// Commitment of the last verified entry
    pub head: Commitment,
}

impl VerificationResult {
    fn from_cursor(cursor: &ChainCursor, failure: Option<ChainBreak>) -> Self {
        Self {
            partition_id: cursor.partition_id.clone(),
            ok: failure.is_none(),
            entries_checked: cursor.checked(),
            first_broken_sequence: failure.as_ref().map(|b| b.sequence),
            reason: failure.as_ref().map(|b| b.reason),
            detail: failure.map(|b| b.detail),
            head: cursor.head().clone(),
        }
    }

    /// Convert a broken chain into [`LedgerError::VerificationFailure`]
    pub fn into_result(self) -> LedgerResult<Self> {
        match (self.ok, self.first_broken_sequence, self.reason) {
            (false, Some(sequence), Some(reason)) => Err(LedgerError::VerificationFailure {
                partition_id: self.partition_id.to_string(),
                sequence,
                reason,
            }),
            _ => Ok(self),
        }
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        if self.ok {
            format!(
                "✅ Partition {} is valid ({} entries)",
                self.partition_id, self.entries_checked
            )
        } else {
            format!(
                "❌ Partition {} is broken at sequence {}: {}",
                self.partition_id,
                self.first_broken_sequence.unwrap_or_default(),
                self.reason.map(|r| r.to_string()).unwrap_or_else(|| "unknown".into())
            )
        }
    }

    /// Get detailed status
    pub fn detailed_status(&self) -> String {
        format!(
            "Entries verified: {}\nHead: {}\nStatus: {}\nDetail: {}",
            self.entries_checked,
            self.head,
            if self.ok { "✅ Valid" } else { "❌ Broken" },
            self.detail.as_deref().unwrap_or("None")
        )
    }
}

/// Verify an in-memory slice of a partition's entries, starting at sequence 1
pub fn verify_entries(
    partition_id: &PartitionId,
    entries: &[AuditEntry],
    algorithm: HashAlgorithm,
) -> VerificationResult {
    let mut cursor = ChainCursor::new(partition_id.clone(), algorithm);
    let failure = entries.iter().find_map(|entry| cursor.check(entry).err());
    VerificationResult::from_cursor(&cursor, failure)
}

/// Find entries whose stored commitment does not match their content
pub fn find_tampered_entries(entries: &[AuditEntry], algorithm: HashAlgorithm) -> Vec<u64> {
    entries
        .iter()
        .filter(|entry| !entry.verify_commitment(algorithm))
        .map(|entry| entry.sequence_number)
        .collect()
}

#[derive(Clone)]
pub struct ChainVerifier {
    reader: LedgerReader,
    algorithm: HashAlgorithm,
    batch_size: usize,
}

impl ChainVerifier {
    pub fn new(reader: LedgerReader, algorithm: HashAlgorithm) -> Self {
        Self {
            reader,
            algorithm,
            batch_size: DEFAULT_VERIFY_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Replay `partition_id` from sequence 1 to the current tail.
    ///
    /// Entries appended while verification runs are either verified or not
    /// seen at all; the snapshot's tail is never reported as broken.
    pub async fn verify(&self, partition_id: &PartitionId) -> LedgerResult<VerificationResult> {
        let mut cursor = ChainCursor::new(partition_id.clone(), self.algorithm);
        let mut after = 0;

        let failure = loop {
            let page = self
                .reader
                .read_records(partition_id, after, self.batch_size)
                .await?;
            let Some(last) = page.last() else {
                break None;
            };
            after = last.sequence_number();
            let failure = page.iter().find_map(|record| cursor.check_record(record).err());
            if let Some(failure) = failure {
                break Some(failure);
            }
            debug!(
                "Verified partition {} through sequence {}",
                partition_id,
                cursor.checked()
            );
        };

        let result = VerificationResult::from_cursor(&cursor, failure);
        if result.ok {
            info!(
                "Audit chain verification successful: partition {} ({} entries)",
                partition_id, result.entries_checked
            );
        } else {
            error!(
                "Audit chain broken in partition {} at sequence {:?}: {}",
                partition_id,
                result.first_broken_sequence,
                result.detail.as_deref().unwrap_or("unknown")
            );
        }
        Ok(result)
    }

    /// Verify every partition known to the store
    pub async fn verify_all(&self) -> LedgerResult<Vec<VerificationResult>> {
        let mut results = Vec::new();
        for partition_id in self.reader.partitions().await? {
            results.push(self.verify(&partition_id).await?);
        }
        Ok(results)
    }
}
