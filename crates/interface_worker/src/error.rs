//! Worker error handling

use thiserror::Error;

use domain_billing::BillingError;
use infra_db::DatabaseError;

/// Errors that stop the worker from starting or abort a scheduler pass
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Billing error: {0}")]
    Billing(#[from] BillingError),

    /// The HTTP client for the payment gateway could not be built
    #[error("Gateway client error: {0}")]
    Gateway(String),
}

impl WorkerError {
    /// True for errors worth retrying on the next tick
    pub fn is_transient(&self) -> bool {
        match self {
            WorkerError::Billing(err) => err.is_transient(),
            WorkerError::Database(err) => err.is_connection_error() || err.is_conflict(),
            _ => false,
        }
    }
}
