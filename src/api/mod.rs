//! HTTP surface for the ledger: recording, paginated reads and on-demand
//! verification.

pub mod handlers;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::audit::{ChainVerifier, LedgerReader, LedgerWriter};
use crate::config::AppConfig;
use crate::database::LedgerStore;
use crate::error::LedgerError;

#[derive(Clone)]
pub struct AppState {
    pub writer: Arc<LedgerWriter>,
    pub reader: LedgerReader,
    pub verifier: ChainVerifier,
    pub default_page_limit: usize,
}

impl AppState {
    pub fn new(store: Arc<dyn LedgerStore>, config: &AppConfig) -> Self {
        let writer = LedgerWriter::new(store.clone(), config.hash_algorithm)
            .with_max_retries(config.max_append_retries);
        let reader = LedgerReader::new(store).with_max_page_limit(config.max_page_limit);
        let verifier = ChainVerifier::new(reader.clone(), config.hash_algorithm)
            .with_batch_size(config.verify_batch_size);

        Self {
            writer: Arc::new(writer),
            reader,
            verifier,
            default_page_limit: config.default_page_limit,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/partitions/:partition_id/entries",
            get(handlers::list_entries).post(handlers::record_entry),
        )
        .route("/partitions/:partition_id/verify", get(handlers::verify_partition))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).into_inner())
        .with_state(state)
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = match &self {
            LedgerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            LedgerError::Conflict(_) | LedgerError::VerificationFailure { .. } => {
                StatusCode::CONFLICT
            }
            LedgerError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::Serialization(_) | LedgerError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
