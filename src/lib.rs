pub mod api;
pub mod audit;
pub mod config;
pub mod database;
pub mod error;

pub use error::{LedgerError, LedgerResult};
