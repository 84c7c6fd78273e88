use thiserror::Error;

use crate::record::IssuanceStatus;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("A record for '{0}' already exists")]
    DuplicateDomain(String),

    #[error("No record for '{0}'")]
    NotFound(String),

    #[error("Record for '{domain}' is {actual}, expected {expected}")]
    StaleStatus {
        domain: String,
        expected: IssuanceStatus,
        actual: IssuanceStatus,
    },

    #[error("Invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        from: IssuanceStatus,
        to: IssuanceStatus,
        reason: &'static str,
    },

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
