//! Persistent domain records for dnscert
//!
//! One record per domain. Creation is conditioned on absence and every status change is a
//! compare-and-set on the current status, so concurrent triggers for the same domain converge
//! without a global lock.

mod error;
mod record;
mod sqlite;

use chrono::{DateTime, Utc};

pub use error::{StoreError, StoreResult};
pub use record::{CertificateMaterial, DomainRecord, IssuanceStatus};
pub use sqlite::SqliteDomainStore;

pub trait DomainStore: Send + Sync {
    /// Insert `record`. Fails with [`StoreError::DuplicateDomain`] when the domain exists.
    fn create_if_absent(&self, record: &DomainRecord) -> StoreResult<()>;

    fn get(&self, domain: &str) -> StoreResult<Option<DomainRecord>>;

    /// Move `domain` from `expected` to `next`, only if it is still at `expected`.
    ///
    /// `certificate` must be present exactly when `next` is `Complete`.
    fn advance_status(
        &self,
        domain: &str,
        expected: IssuanceStatus,
        next: IssuanceStatus,
        certificate: Option<&CertificateMaterial>,
    ) -> StoreResult<()>;

    /// Store `key_pem` as the certificate key of a `TextRecordMatched` domain unless one is
    /// already reserved. Returns the key that is reserved afterwards.
    fn reserve_certificate_key(&self, domain: &str, key_pem: &str) -> StoreResult<String>;

    /// Unexpired domains not yet complete, oldest first
    fn list_pending(&self, now: DateTime<Utc>) -> StoreResult<Vec<String>>;

    /// Delete incomplete records past their retention deadline; returns how many
    fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

/// Check a requested transition before touching storage
pub fn validate_transition(
    expected: IssuanceStatus,
    next: IssuanceStatus,
    certificate: Option<&CertificateMaterial>,
) -> StoreResult<()> {
    if next <= expected {
        return Err(StoreError::InvalidTransition {
            from: expected,
            to: next,
            reason: "status only moves forward",
        });
    }
    if next.is_complete() != certificate.is_some() {
        return Err(StoreError::InvalidTransition {
            from: expected,
            to: next,
            reason: "certificate material accompanies exactly the move to Complete",
        });
    }
    Ok(())
}
