use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use tracing::info;

use crate::audit::hasher::HashAlgorithm;
use crate::audit::reader::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use crate::audit::verify::DEFAULT_VERIFY_BATCH_SIZE;
use crate::audit::writer::DEFAULT_MAX_APPEND_RETRIES;
use crate::error::{LedgerError, LedgerResult};

const DEFAULT_CONFIG_FILE: &str = "audit-ledger.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    /// Fixed for the lifetime of a ledger; verification must use the writer's algorithm
    pub hash_algorithm: HashAlgorithm,
    pub server_host: String,
    pub server_port: u16,
    pub max_append_retries: u32,
    pub default_page_limit: usize,
    pub max_page_limit: usize,
    pub verify_batch_size: usize,
}

impl AppConfig {
    /// Load from defaults, then `audit-ledger.toml` (or `AUDIT_LEDGER_CONFIG`),
    /// then `LEDGER_*` environment variables
    pub fn load() -> LedgerResult<Self> {
        let path =
            env::var("AUDIT_LEDGER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> LedgerResult<Self> {
        let config = Config::builder()
            .set_default("database_url", "sqlite://audit-ledger.db")?
            .set_default("hash_algorithm", "sha256")?
            .set_default("server_host", "0.0.0.0")?
            .set_default("server_port", 3000_i64)?
            .set_default("max_append_retries", i64::from(DEFAULT_MAX_APPEND_RETRIES))?
            .set_default("default_page_limit", DEFAULT_PAGE_LIMIT as i64)?
            .set_default("max_page_limit", MAX_PAGE_LIMIT as i64)?
            .set_default("verify_batch_size", DEFAULT_VERIFY_BATCH_SIZE as i64)?
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("LEDGER"))
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        app_config.validate()?;
        info!(
            "Configuration loaded (hash algorithm: {}, database: {})",
            app_config.hash_algorithm, app_config.database_url
        );
        Ok(app_config)
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.database_url.is_empty() {
            return Err(LedgerError::Config("database_url must not be empty".into()));
        }
        if self.max_page_limit == 0 || self.verify_batch_size == 0 {
            return Err(LedgerError::Config(
                "max_page_limit and verify_batch_size must be positive".into(),
            ));
        }
        if self.default_page_limit > self.max_page_limit {
            return Err(LedgerError::Config(format!(
                "default_page_limit {} exceeds max_page_limit {}",
                self.default_page_limit, self.max_page_limit
            )));
        }
        Ok(())
    }
}
