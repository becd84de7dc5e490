use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::api::AppState;
use crate::audit::{
    ActorId, AuditAction, AuditContext, AuditEntry, AuditEvent, AuditPage, PartitionId,
    VerificationResult,
};
use crate::error::LedgerResult;

#[derive(Debug, Deserialize)]
pub struct RecordRequest {
    pub actor_id: ActorId,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub before_state: Option<Value>,
    #[serde(default)]
    pub after_state: Option<Value>,
    #[serde(default)]
    pub context: AuditContext,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub after: u64,
    pub limit: Option<usize>,
}

pub async fn health_check() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "audit-ledger",
        "timestamp": chrono::Utc::now()
    }))
}

pub async fn record_entry(
    State(state): State<AppState>,
    Path(partition_id): Path<String>,
    Json(request): Json<RecordRequest>,
) -> LedgerResult<(StatusCode, Json<AuditEntry>)> {
    let partition_id = PartitionId::new(partition_id)?;
    let event = AuditEvent {
        partition_id,
        actor_id: request.actor_id,
        action: request.action,
        entity_type: request.entity_type,
        entity_id: request.entity_id,
        before_state: request.before_state,
        after_state: request.after_state,
        context: request.context,
    };

    let entry = state.writer.record_with_retry(event).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn list_entries(
    State(state): State<AppState>,
    Path(partition_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> LedgerResult<Json<AuditPage>> {
    let partition_id = PartitionId::new(partition_id)?;
    let limit = query.limit.unwrap_or(state.default_page_limit);
    let page = state.reader.page(&partition_id, query.after, limit).await?;
    Ok(Json(page))
}

pub async fn verify_partition(
    State(state): State<AppState>,
    Path(partition_id): Path<String>,
) -> LedgerResult<Json<VerificationResult>> {
    let partition_id = PartitionId::new(partition_id)?;
    info!("On-demand verification requested for partition {}", partition_id);
    let result = state.verifier.verify(&partition_id).await?;
    Ok(Json(result))
}
