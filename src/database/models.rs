use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::audit::entry::{ActorId, AuditContext, AuditEntry, ChainHead, PartitionId};
use crate::audit::hasher::Commitment;
use crate::error::{LedgerError, LedgerResult};

/// Row of the `audit_log` table as stored
#[derive(Debug, Clone, FromRow)]
pub struct AuditLogRow {
    pub id: String,
    pub partition_id: String,
    pub sequence_number: i64,
    pub actor_id: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub before_state: Option<String>,
    pub after_state: Option<String>,
    pub context: String,
    pub previous_commitment: String,
    pub commitment: String,
    pub created_at: String,
}

/// Tail columns of a partition
#[derive(Debug, Clone, FromRow)]
pub struct ChainHeadRow {
    pub sequence_number: i64,
    pub commitment: String,
    pub created_at: String,
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> LedgerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| LedgerError::Serialization(format!("invalid timestamp {}: {}", value, e)))
}

pub fn to_db_sequence(sequence_number: u64) -> LedgerResult<i64> {
    i64::try_from(sequence_number).map_err(|_| {
        LedgerError::InvalidInput(format!("sequence number {} out of range", sequence_number))
    })
}

fn from_db_sequence(sequence_number: i64) -> LedgerResult<u64> {
    u64::try_from(sequence_number).map_err(|_| {
        LedgerError::Serialization(format!("negative sequence number {}", sequence_number))
    })
}

fn parse_state(value: Option<String>) -> LedgerResult<Option<Value>> {
    value.map(|raw| serde_json::from_str(&raw)).transpose().map_err(Into::into)
}

fn format_state(value: &Option<Value>) -> LedgerResult<Option<String>> {
    value.as_ref().map(serde_json::to_string).transpose().map_err(Into::into)
}

impl TryFrom<&AuditEntry> for AuditLogRow {
    type Error = LedgerError;

    fn try_from(entry: &AuditEntry) -> Result<Self, Self::Error> {
        Ok(Self {
            id: entry.id.to_string(),
            partition_id: entry.partition_id.to_string(),
            sequence_number: to_db_sequence(entry.sequence_number)?,
            actor_id: entry.actor_id.to_string(),
            action: entry.action.as_str().to_string(),
            entity_type: entry.entity_type.clone(),
            entity_id: entry.entity_id.clone(),
            before_state: format_state(&entry.before_state)?,
            after_state: format_state(&entry.after_state)?,
            context: serde_json::to_string(&entry.context)?,
            previous_commitment: entry.previous_commitment.to_string(),
            commitment: entry.commitment.to_string(),
            created_at: format_timestamp(&entry.created_at),
        })
    }
}

/// Decode the `context` column, refusing anything its typed form would not
/// reproduce, such as unknown keys or explicit nulls.
fn parse_context(raw: &str) -> LedgerResult<AuditContext> {
    let stored: Value = serde_json::from_str(raw)?;
    let context: AuditContext = serde_json::from_value(stored.clone())?;
    if serde_json::to_value(&context)? != stored {
        return Err(LedgerError::Serialization(format!(
            "context column is not in canonical form: {}",
            raw
        )));
    }
    Ok(context)
}

fn parse_created_at(raw: &str) -> LedgerResult<DateTime<Utc>> {
    let created_at = parse_timestamp(raw)?;
    if format_timestamp(&created_at) != raw {
        return Err(LedgerError::Serialization(format!(
            "created_at is not in canonical form: {}",
            raw
        )));
    }
    Ok(created_at)
}

impl TryFrom<AuditLogRow> for AuditEntry {
    type Error = LedgerError;

    fn try_from(row: AuditLogRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| LedgerError::Serialization(format!("invalid entry id {}: {}", row.id, e)))?;
        let context = parse_context(&row.context)?;

        Ok(Self {
            id,
            partition_id: PartitionId::new(row.partition_id)?,
            sequence_number: from_db_sequence(row.sequence_number)?,
            actor_id: ActorId::try_from(row.actor_id)?,
            action: row.action.parse()?,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            before_state: parse_state(row.before_state)?,
            after_state: parse_state(row.after_state)?,
            context,
            previous_commitment: Commitment::parse(row.previous_commitment)?,
            commitment: Commitment::parse(row.commitment)?,
            created_at: parse_created_at(&row.created_at)?,
        })
    }
}

impl TryFrom<ChainHeadRow> for ChainHead {
    type Error = LedgerError;

    fn try_from(row: ChainHeadRow) -> Result<Self, Self::Error> {
        Ok(Self {
            sequence_number: from_db_sequence(row.sequence_number)?,
            commitment: Commitment::parse(row.commitment)?,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}
