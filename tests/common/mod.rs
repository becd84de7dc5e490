#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use audit_ledger::audit::{
    ActorId, AuditAction, AuditContext, AuditEntry, AuditEvent, ChainHead, HashAlgorithm,
    LedgerReader, LedgerWriter, PartitionId,
};
use audit_ledger::config::AppConfig;
use audit_ledger::database::{Database, LedgerStore, MemoryLedgerStore};
use audit_ledger::{LedgerError, LedgerResult};

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Arc<Database> {
    Arc::new(
        Database::new_in_memory()
            .await
            .expect("Failed to create test database"),
    )
}

pub fn partition(id: &str) -> PartitionId {
    PartitionId::new(id).expect("valid partition id")
}

pub fn writer(store: Arc<dyn LedgerStore>) -> LedgerWriter {
    LedgerWriter::new(store, HashAlgorithm::Sha256)
}

pub fn reader(store: Arc<dyn LedgerStore>) -> LedgerReader {
    LedgerReader::new(store)
}

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".to_string(),
        hash_algorithm: HashAlgorithm::Sha256,
        server_host: "127.0.0.1".to_string(),
        server_port: 0,
        max_append_retries: 3,
        default_page_limit: 2,
        max_page_limit: 10,
        verify_batch_size: 4,
    }
}

/// An evidence update made by a compliance analyst
pub fn evidence_event(partition_id: &PartitionId, entity_id: &str, status: &str) -> AuditEvent {
    AuditEvent::new(
        partition_id.clone(),
        ActorId::principal("analyst-7").expect("valid actor"),
        AuditAction::Update,
        "evidence",
        entity_id,
    )
    .with_before(json!({"status": "draft"}))
    .with_after(json!({"status": status, "reviewed": true}))
    .with_context(
        AuditContext::default()
            .with_request_id("req-1")
            .with_extra("source", json!("integration-test")),
    )
}

pub fn control_event(partition_id: &PartitionId, entity_id: &str, after: Value) -> AuditEvent {
    AuditEvent::new(
        partition_id.clone(),
        ActorId::System,
        AuditAction::Create,
        "control",
        entity_id,
    )
    .with_after(after)
}

/// Store whose appends can be made to fail or stall, wrapping a memory store
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryLedgerStore,
    fail_appends: AtomicBool,
    append_delay: Option<Duration>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_append_delay(delay: Duration) -> Self {
        Self {
            append_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self, partition_id: &PartitionId) -> usize {
        self.inner.len(partition_id).await
    }
}

#[async_trait]
impl LedgerStore for FaultyStore {
    async fn head(&self, partition_id: &PartitionId) -> LedgerResult<Option<ChainHead>> {
        self.inner.head(partition_id).await
    }

    async fn append(&self, entry: &AuditEntry) -> LedgerResult<()> {
        if let Some(delay) = self.append_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(LedgerError::Persistence("storage unavailable".into()));
        }
        self.inner.append(entry).await
    }

    async fn read(
        &self,
        partition_id: &PartitionId,
        after_sequence: u64,
        limit: usize,
    ) -> LedgerResult<Vec<AuditEntry>> {
        self.inner.read(partition_id, after_sequence, limit).await
    }

    async fn partitions(&self) -> LedgerResult<Vec<PartitionId>> {
        self.inner.partitions().await
    }
}
