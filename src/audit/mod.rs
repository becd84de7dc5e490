//! Audit Ledger
//!
//! Tamper-evident, append-only audit trail. Entries are sequenced per
//! partition and each commits to its predecessor through a hash chain.

pub mod entry;
pub mod hasher;
pub mod reader;
pub mod sequencer;
pub mod verify;
pub mod writer;

pub use entry::{ActorId, AuditAction, AuditContext, AuditEntry, AuditEvent, ChainHead, PartitionId};
pub use hasher::{Commitment, HashAlgorithm};
pub use reader::{AuditPage, LedgerReader};
pub use sequencer::{SequenceSlot, Sequencer};
pub use verify::{verify_entries, BreakReason, ChainVerifier, VerificationResult};
pub use writer::LedgerWriter;
