use dc_acme::AcmeError;
use dc_keys::KeyError;
use dc_store::{IssuanceStatus, StoreError};
use std::fmt;
use thiserror::Error;

/// The workflow step an error interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Intake,
    VerifyTextRecord,
    Finalize,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Intake => "intake -> WaitDnsAuthorization",
            Self::VerifyTextRecord => "WaitDnsAuthorization -> TextRecordMatched",
            Self::Finalize => "TextRecordMatched -> Complete",
        })
    }
}

#[derive(Error, Debug)]
pub enum IssuanceError {
    #[error("Terms of service not accepted for '{domain}'")]
    TermsNotAccepted { domain: String },

    #[error("Invalid domain name '{domain}'")]
    InvalidDomain { domain: String },

    #[error("A record for '{domain}' already exists")]
    DuplicateDomain { domain: String },

    #[error("Malformed client key for '{domain}': {source}")]
    MalformedKey { domain: String, source: KeyError },

    #[error("Key material for '{domain}': {source}")]
    Key { domain: String, source: KeyError },

    #[error("CA error for '{domain}' during {transition}: {source}")]
    Ca {
        domain: String,
        transition: Transition,
        source: AcmeError,
    },

    #[error("No record for '{domain}'")]
    NotFound { domain: String },

    #[error("'{domain}' is {status}, not ready for finalization")]
    NotReady {
        domain: String,
        status: IssuanceStatus,
    },

    #[error("'{domain}' moved to {actual} concurrently (expected {expected})")]
    StaleStatus {
        domain: String,
        expected: IssuanceStatus,
        actual: IssuanceStatus,
    },

    #[error("Store error for '{domain}': {source}")]
    Store { domain: String, source: StoreError },
}

impl IssuanceError {
    pub(crate) fn store(domain: &str, e: StoreError) -> Self {
        match e {
            StoreError::DuplicateDomain(domain) => Self::DuplicateDomain { domain },
            StoreError::NotFound(domain) => Self::NotFound { domain },
            StoreError::StaleStatus {
                domain,
                expected,
                actual,
            } => Self::StaleStatus {
                domain,
                expected,
                actual,
            },
            other => Self::Store {
                domain: domain.to_string(),
                source: other,
            },
        }
    }

    pub(crate) fn ca(domain: &str, transition: Transition, source: AcmeError) -> Self {
        Self::Ca {
            domain: domain.to_string(),
            transition,
            source,
        }
    }

    /// Lost races with a concurrent invocation; nothing to report
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::StaleStatus { .. } | Self::DuplicateDomain { .. }
        )
    }

    /// Rejected request, as opposed to a failure of the CA or the store
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::TermsNotAccepted { .. }
                | Self::InvalidDomain { .. }
                | Self::DuplicateDomain { .. }
                | Self::MalformedKey { .. }
        )
    }

    pub fn domain(&self) -> &str {
        match self {
            Self::TermsNotAccepted { domain }
            | Self::InvalidDomain { domain }
            | Self::DuplicateDomain { domain }
            | Self::MalformedKey { domain, .. }
            | Self::Key { domain, .. }
            | Self::Ca { domain, .. }
            | Self::NotFound { domain }
            | Self::NotReady { domain, .. }
            | Self::StaleStatus { domain, .. }
            | Self::Store { domain, .. } => domain,
        }
    }
}

pub type IssuanceResult<T> = Result<T, IssuanceError>;
