use thiserror::Error;

use crate::audit::verify::BreakReason;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::Conflict(format!("Concurrent append detected: {}", db_err))
            }
            // SQLITE_BUSY and SQLITE_BUSY_SNAPSHOT: another connection holds the write lock.
            sqlx::Error::Database(db_err)
                if matches!(db_err.code().as_deref(), Some("5" | "517")) =>
            {
                Self::Conflict(format!("Concurrent append detected: {}", db_err))
            }
            _ => Self::Persistence(format!("Database error: {}", err)),
        }
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    /// A concurrent append won the race for the partition tail. Retry the whole
    /// record operation against the new tail.
    #[error("Append conflict: {0}")]
    Conflict(String),

    /// The durable store rejected or failed the write.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Chain verification failed for partition {partition_id} at sequence {sequence}: {reason}")]
    VerificationFailure {
        partition_id: String,
        sequence: u64,
        reason: BreakReason,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn conflict(partition_id: &str, detail: impl std::fmt::Display) -> Self {
        Self::Conflict(format!("partition {}: {}", partition_id, detail))
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
