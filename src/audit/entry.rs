//! Audit Log Entry
//!
//! Defines the immutable ledger entry, the event callers submit to the
//! writer, and the identifier types threaded through every call.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::audit::hasher::{self, Commitment, HashAlgorithm};
use crate::error::{LedgerError, LedgerResult};

const MAX_PARTITION_ID_LEN: usize = 128;
const SYSTEM_ACTOR: &str = "system";

/// Tenant/organization scope for sequencing and chaining
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(id: impl Into<String>) -> LedgerResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(LedgerError::InvalidInput("partition id must not be empty".into()));
        }
        if id.len() > MAX_PARTITION_ID_LEN {
            return Err(LedgerError::InvalidInput(format!(
                "partition id exceeds {} bytes",
                MAX_PARTITION_ID_LEN
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(LedgerError::InvalidInput(
                "partition id must not contain control characters".into(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PartitionId {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PartitionId> for String {
    fn from(id: PartitionId) -> Self {
        id.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Acting principal, or the reserved system actor for automated events
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActorId {
    System,
    Principal(String),
}

impl ActorId {
    pub fn principal(id: impl Into<String>) -> LedgerResult<Self> {
        Self::try_from(id.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::System => SYSTEM_ACTOR,
            Self::Principal(id) => id,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }
}

impl TryFrom<String> for ActorId {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(LedgerError::InvalidInput("actor id must not be empty".into()));
        }
        if value == SYSTEM_ACTOR {
            Ok(Self::System)
        } else {
            Ok(Self::Principal(value))
        }
    }
}

impl From<ActorId> for String {
    fn from(actor: ActorId) -> Self {
        actor.as_str().to_string()
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed vocabulary of audited actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    StatusChange,
    Invite,
    RoleChange,
    Link,
    Unlink,
    Export,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::StatusChange => "status_change",
            Self::Invite => "invite",
            Self::RoleChange => "role_change",
            Self::Link => "link",
            Self::Unlink => "unlink",
            Self::Export => "export",
        }
    }
}

impl FromStr for AuditAction {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "status_change" => Ok(Self::StatusChange),
            "invite" => Ok(Self::Invite),
            "role_change" => Ok(Self::RoleChange),
            "link" => Ok(Self::Link),
            "unlink" => Ok(Self::Unlink),
            "export" => Ok(Self::Export),
            other => Err(LedgerError::InvalidInput(format!("unknown audit action: {}", other))),
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request metadata captured at write time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl AuditContext {
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A state-changing action submitted by a collaborator for recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub partition_id: PartitionId,
    pub actor_id: ActorId,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: String,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub context: AuditContext,
}

impl AuditEvent {
    pub fn new(
        partition_id: PartitionId,
        actor_id: ActorId,
        action: AuditAction,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            partition_id,
            actor_id,
            action,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            before_state: None,
            after_state: None,
            context: AuditContext::default(),
        }
    }

    pub fn with_before(mut self, state: Value) -> Self {
        self.before_state = Some(state);
        self
    }

    pub fn with_after(mut self, state: Value) -> Self {
        self.after_state = Some(state);
        self
    }

    pub fn with_context(mut self, context: AuditContext) -> Self {
        self.context = context;
        self
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.entity_type.trim().is_empty() {
            return Err(LedgerError::InvalidInput("entity_type must not be empty".into()));
        }
        if self.entity_id.trim().is_empty() {
            return Err(LedgerError::InvalidInput("entity_id must not be empty".into()));
        }
        Ok(())
    }
}

/// Immutable ledger entry with cryptographic hash chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub partition_id: PartitionId,
    pub sequence_number: u64,
    pub actor_id: ActorId,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: String,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub context: AuditContext,
    pub previous_commitment: Commitment,
    pub commitment: Commitment,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Build an entry at `sequence_number` linked to `previous_commitment` and
    /// compute its commitment.
    ///
    /// `created_at` is truncated to microseconds so that it survives storage
    /// unchanged.
    pub fn seal(
        event: AuditEvent,
        sequence_number: u64,
        previous_commitment: Commitment,
        created_at: DateTime<Utc>,
        algorithm: HashAlgorithm,
    ) -> LedgerResult<Self> {
        event.validate()?;
        if sequence_number == 0 {
            return Err(LedgerError::InvalidInput("sequence numbers start at 1".into()));
        }

        let mut entry = Self {
            id: Uuid::new_v4(),
            partition_id: event.partition_id,
            sequence_number,
            actor_id: event.actor_id,
            action: event.action,
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            before_state: event.before_state,
            after_state: event.after_state,
            context: event.context,
            previous_commitment,
            commitment: Commitment::genesis(algorithm),
            created_at: created_at.trunc_subsecs(6),
        };

        entry.commitment = hasher::commit(&entry, &entry.previous_commitment, algorithm)?;
        Ok(entry)
    }

    /// Recompute this entry's commitment and compare with the stored value
    pub fn verify_commitment(&self, algorithm: HashAlgorithm) -> bool {
        hasher::verify_commitment(self, algorithm)
    }

    pub fn head(&self) -> ChainHead {
        ChainHead {
            sequence_number: self.sequence_number,
            commitment: self.commitment.clone(),
            created_at: self.created_at,
        }
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "{}#{} {} {}:{} by {}",
            self.partition_id,
            self.sequence_number,
            self.action,
            self.entity_type,
            self.entity_id,
            self.actor_id
        )
    }
}

/// Tail of a partition's chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHead {
    pub sequence_number: u64,
    pub commitment: Commitment,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> AuditEvent {
        AuditEvent::new(
            PartitionId::new("org-1").unwrap(),
            ActorId::principal("user-42").unwrap(),
            AuditAction::Create,
            "risk",
            "RSK-001",
        )
        .with_after(json!({"title": "Vendor outage", "score": 12}))
    }

    #[test]
    fn test_partition_id_validation() {
        assert!(PartitionId::new("").is_err());
        assert!(PartitionId::new("a".repeat(129)).is_err());
        assert!(PartitionId::new("org\n1").is_err());
        assert_eq!(PartitionId::new("org-1").unwrap().as_str(), "org-1");
    }

    #[test]
    fn test_actor_id_reserved_system_value() {
        assert_eq!(ActorId::principal("system").unwrap(), ActorId::System);
        assert!(ActorId::principal("").is_err());

        let json = serde_json::to_string(&ActorId::System).unwrap();
        assert_eq!(json, "\"system\"");
        let actor: ActorId = serde_json::from_str("\"user-7\"").unwrap();
        assert_eq!(actor, ActorId::Principal("user-7".into()));
    }

    #[test]
    fn test_action_vocabulary_is_closed() {
        assert_eq!("status_change".parse::<AuditAction>().unwrap(), AuditAction::StatusChange);
        assert!("drop_table".parse::<AuditAction>().is_err());
        assert!(serde_json::from_str::<AuditAction>("\"drop_table\"").is_err());
        assert_eq!(serde_json::to_string(&AuditAction::RoleChange).unwrap(), "\"role_change\"");
    }

    #[test]
    fn test_seal_computes_commitment() {
        let genesis = Commitment::genesis(HashAlgorithm::Sha256);
        let entry =
            AuditEntry::seal(event(), 1, genesis.clone(), Utc::now(), HashAlgorithm::Sha256)
                .unwrap();

        assert_eq!(entry.sequence_number, 1);
        assert_eq!(entry.previous_commitment, genesis);
        assert_ne!(entry.commitment, genesis);
        assert!(entry.verify_commitment(HashAlgorithm::Sha256));
        assert_eq!(entry.created_at.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn test_seal_rejects_invalid_events() {
        let genesis = Commitment::genesis(HashAlgorithm::Sha256);
        let mut bad = event();
        bad.entity_id = "  ".into();
        assert!(AuditEntry::seal(bad, 1, genesis.clone(), Utc::now(), HashAlgorithm::Sha256)
            .is_err());
        assert!(AuditEntry::seal(event(), 0, genesis, Utc::now(), HashAlgorithm::Sha256).is_err());
    }

    #[test]
    fn test_entry_json_roundtrip_keeps_commitment_valid() {
        let entry = AuditEntry::seal(
            event().with_context(AuditContext::default().with_request_id("req-1")),
            1,
            Commitment::genesis(HashAlgorithm::Sha256),
            Utc::now(),
            HashAlgorithm::Sha256,
        )
        .unwrap();

        let json = serde_json::to_string(&entry).unwrap();
        let decoded: AuditEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, entry);
        assert!(decoded.verify_commitment(HashAlgorithm::Sha256));
    }
}
