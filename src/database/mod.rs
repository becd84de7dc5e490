//! Ledger Storage
//!
//! The [`LedgerStore`] contract every backend satisfies, and the SQLite
//! implementation used by the service.

pub mod memory;
pub mod models;
pub mod schema;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::audit::entry::{AuditEntry, ChainHead, PartitionId};
use crate::error::{LedgerError, LedgerResult};
use models::{to_db_sequence, AuditLogRow, ChainHeadRow};

pub use memory::MemoryLedgerStore;

/// Durable, append-only storage for audit entries.
///
/// Implementations expose insert and read only. `append` must be atomic
/// with respect to other appends on the same partition and must refuse an
/// entry that does not extend the current tail.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Last entry of the partition, if any.
    async fn head(&self, partition_id: &PartitionId) -> LedgerResult<Option<ChainHead>>;

    /// Append `entry` if it directly extends the partition tail.
    ///
    /// The entry's `sequence_number` must be the tail's plus one (or 1 for an
    /// empty partition) and its `previous_commitment` must equal the tail's
    /// commitment. Otherwise fails with [`LedgerError::Conflict`].
    async fn append(&self, entry: &AuditEntry) -> LedgerResult<()>;

    /// Entries with `sequence_number > after_sequence`, ascending, at most
    /// `limit` of them.
    async fn read(
        &self,
        partition_id: &PartitionId,
        after_sequence: u64,
        limit: usize,
    ) -> LedgerResult<Vec<AuditEntry>>;

    /// Every partition holding at least one entry.
    async fn partitions(&self) -> LedgerResult<Vec<PartitionId>>;

    /// Like [`LedgerStore::read`], but a row that no longer decodes is
    /// returned as [`StoredRecord::Undecodable`] instead of failing the page.
    async fn read_records(
        &self,
        partition_id: &PartitionId,
        after_sequence: u64,
        limit: usize,
    ) -> LedgerResult<Vec<StoredRecord>> {
        let entries = self.read(partition_id, after_sequence, limit).await?;
        Ok(entries.into_iter().map(StoredRecord::Entry).collect())
    }
}

/// A stored row as seen by chain verification
#[derive(Debug, Clone, PartialEq)]
pub enum StoredRecord {
    Entry(AuditEntry),
    /// Columns were altered into values that no longer form an entry
    Undecodable { sequence_number: u64, detail: String },
}

impl StoredRecord {
    pub fn sequence_number(&self) -> u64 {
        match self {
            Self::Entry(entry) => entry.sequence_number,
            Self::Undecodable {
                sequence_number, ..
            } => *sequence_number,
        }
    }
}

/// Check that `entry` extends `head`; shared by every backend.
pub(crate) fn check_extends(entry: &AuditEntry, head: Option<&ChainHead>) -> LedgerResult<()> {
    let partition = entry.partition_id.as_str();
    match head {
        None if entry.sequence_number != 1 => Err(LedgerError::conflict(
            partition,
            format!("partition is empty but entry has sequence {}", entry.sequence_number),
        )),
        None => Ok(()),
        Some(head) if entry.sequence_number != head.sequence_number + 1 => {
            Err(LedgerError::conflict(
                partition,
                format!(
                    "expected sequence {}, got {}",
                    head.sequence_number + 1,
                    entry.sequence_number
                ),
            ))
        }
        Some(head) if entry.previous_commitment != head.commitment => Err(LedgerError::conflict(
            partition,
            format!(
                "expected previous commitment {}, got {}",
                head.commitment, entry.previous_commitment
            ),
        )),
        Some(_) => Ok(()),
    }
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the SQLite database at `database_url`
    pub async fn connect(database_url: &str) -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        info!("Connected to audit database at {}", database_url);
        Ok(Database { pool })
    }

    /// Open an existing database, failing instead of creating an empty one
    pub async fn open_existing(database_url: &str) -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(false)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        info!("Opened existing audit database at {}", database_url);
        Ok(Database { pool })
    }

    /// Single-connection in-memory database with the schema applied
    pub async fn new_in_memory() -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Database { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> LedgerResult<()> {
        sqlx::raw_sql(schema::AUDIT_LOG_SCHEMA)
            .execute(&self.pool)
            .await?;
        debug!("Audit log schema applied");
        Ok(())
    }

    /// Underlying pool, for read-only tooling and tests
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_rows(
        &self,
        partition_id: &PartitionId,
        after_sequence: u64,
        limit: usize,
    ) -> LedgerResult<Vec<AuditLogRow>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query_as(
            r#"
            SELECT id, partition_id, sequence_number, actor_id, action,
                   entity_type, entity_id, before_state, after_state, context,
                   previous_commitment, commitment, created_at
            FROM audit_log
            WHERE partition_id = ? AND sequence_number > ?
            ORDER BY sequence_number ASC
            LIMIT ?
            "#,
        )
        .bind(partition_id.as_str())
        .bind(to_db_sequence(after_sequence)?)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

const HEAD_QUERY: &str = r#"
    SELECT sequence_number, commitment, created_at
    FROM audit_log
    WHERE partition_id = ?
    ORDER BY sequence_number DESC
    LIMIT 1
"#;

#[async_trait]
impl LedgerStore for Database {
    async fn head(&self, partition_id: &PartitionId) -> LedgerResult<Option<ChainHead>> {
        let row: Option<ChainHeadRow> = sqlx::query_as(HEAD_QUERY)
            .bind(partition_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(ChainHead::try_from).transpose()
    }

    async fn append(&self, entry: &AuditEntry) -> LedgerResult<()> {
        let row = AuditLogRow::try_from(entry)?;
        let mut tx = self.pool.begin().await?;

        let head: Option<ChainHeadRow> = sqlx::query_as(HEAD_QUERY)
            .bind(&row.partition_id)
            .fetch_optional(&mut *tx)
            .await?;
        let head = head.map(ChainHead::try_from).transpose()?;
        check_extends(entry, head.as_ref())?;

        // The primary key turns a racing insert at the same position into a
        // unique violation, which maps to a conflict.
        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, partition_id, sequence_number, actor_id, action,
                entity_type, entity_id, before_state, after_state, context,
                previous_commitment, commitment, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.partition_id)
        .bind(row.sequence_number)
        .bind(&row.actor_id)
        .bind(&row.action)
        .bind(&row.entity_type)
        .bind(&row.entity_id)
        .bind(&row.before_state)
        .bind(&row.after_state)
        .bind(&row.context)
        .bind(&row.previous_commitment)
        .bind(&row.commitment)
        .bind(&row.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn read(
        &self,
        partition_id: &PartitionId,
        after_sequence: u64,
        limit: usize,
    ) -> LedgerResult<Vec<AuditEntry>> {
        let rows = self.fetch_rows(partition_id, after_sequence, limit).await?;
        rows.into_iter().map(AuditEntry::try_from).collect()
    }

    async fn read_records(
        &self,
        partition_id: &PartitionId,
        after_sequence: u64,
        limit: usize,
    ) -> LedgerResult<Vec<StoredRecord>> {
        let rows = self.fetch_rows(partition_id, after_sequence, limit).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                // The CHECK constraint keeps sequence_number positive.
                let sequence_number = u64::try_from(row.sequence_number).unwrap_or_default();
                match AuditEntry::try_from(row) {
                    Ok(entry) => StoredRecord::Entry(entry),
                    Err(e) => StoredRecord::Undecodable {
                        sequence_number,
                        detail: e.to_string(),
                    },
                }
            })
            .collect())
    }

    async fn partitions(&self) -> LedgerResult<Vec<PartitionId>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT partition_id FROM audit_log ORDER BY partition_id")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(|(id,)| PartitionId::new(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{ActorId, AuditAction, AuditEvent};
    use crate::audit::hasher::{Commitment, HashAlgorithm};
    use chrono::Utc;
    use serde_json::json;

    fn entry(partition: &str, sequence: u64, previous: Commitment) -> AuditEntry {
        let event = AuditEvent::new(
            PartitionId::new(partition).unwrap(),
            ActorId::System,
            AuditAction::Create,
            "evidence",
            format!("EVD-{}", sequence),
        )
        .with_after(json!({"n": sequence}));
        AuditEntry::seal(event, sequence, previous, Utc::now(), HashAlgorithm::Sha256).unwrap()
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let db = Database::new_in_memory().await.unwrap();
        let first = entry("org-1", 1, Commitment::genesis(HashAlgorithm::Sha256));
        db.append(&first).await.unwrap();
        let second = entry("org-1", 2, first.commitment.clone());
        db.append(&second).await.unwrap();

        let partition = PartitionId::new("org-1").unwrap();
        let entries = db.read(&partition, 0, 10).await.unwrap();
        assert_eq!(entries, vec![first, second.clone()]);

        let head = db.head(&partition).await.unwrap().unwrap();
        assert_eq!(head, second.head());
    }

    #[tokio::test]
    async fn test_append_rejects_non_extending_entries() {
        let db = Database::new_in_memory().await.unwrap();
        let genesis = Commitment::genesis(HashAlgorithm::Sha256);

        let err = db.append(&entry("org-1", 2, genesis.clone())).await.unwrap_err();
        assert!(err.is_conflict());

        let first = entry("org-1", 1, genesis.clone());
        db.append(&first).await.unwrap();
        let err = db.append(&entry("org-1", 1, genesis.clone())).await.unwrap_err();
        assert!(err.is_conflict());

        let err = db.append(&entry("org-1", 2, genesis)).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_table_rejects_update_and_delete() {
        let db = Database::new_in_memory().await.unwrap();
        db.append(&entry("org-1", 1, Commitment::genesis(HashAlgorithm::Sha256)))
            .await
            .unwrap();

        let update = sqlx::query("UPDATE audit_log SET entity_id = 'x'")
            .execute(db.pool())
            .await;
        assert!(update.is_err());
        let delete = sqlx::query("DELETE FROM audit_log").execute(db.pool()).await;
        assert!(delete.is_err());
    }

    #[tokio::test]
    async fn test_partitions_and_paging() {
        let db = Database::new_in_memory().await.unwrap();
        let mut previous = Commitment::genesis(HashAlgorithm::Sha256);
        for seq in 1..=5 {
            let e = entry("org-b", seq, previous);
            previous = e.commitment.clone();
            db.append(&e).await.unwrap();
        }
        db.append(&entry("org-a", 1, Commitment::genesis(HashAlgorithm::Sha256)))
            .await
            .unwrap();

        let partitions = db.partitions().await.unwrap();
        let names: Vec<&str> = partitions.iter().map(PartitionId::as_str).collect();
        assert_eq!(names, vec!["org-a", "org-b"]);

        let org_b = PartitionId::new("org-b").unwrap();
        let page = db.read(&org_b, 2, 2).await.unwrap();
        let seqs: Vec<u64> = page.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![3, 4]);
        assert!(db.read(&org_b, 5, 10).await.unwrap().is_empty());
        assert!(db.read(&org_b, 0, 0).await.unwrap().is_empty());
    }
}
