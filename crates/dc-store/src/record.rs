use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Issuance progress of a domain. Ordering follows the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IssuanceStatus {
    WaitDnsAuthorization,
    TextRecordMatched,
    Complete,
}

impl IssuanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitDnsAuthorization => "WaitDnsAuthorization",
            Self::TextRecordMatched => "TextRecordMatched",
            Self::Complete => "Complete",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl fmt::Display for IssuanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssuanceStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WaitDnsAuthorization" => Ok(Self::WaitDnsAuthorization),
            "TextRecordMatched" => Ok(Self::TextRecordMatched),
            "Complete" => Ok(Self::Complete),
            other => Err(StoreError::Corrupt(format!("unknown status '{}'", other))),
        }
    }
}

/// Issued certificate key and chain, written together with the move to `Complete`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateMaterial {
    pub private_key_pem: String,
    pub full_chain_pem: String,
}

/// One domain's issuance state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub domain: String,
    pub client_key_pem: String,
    pub authorization_json: String,
    pub status: IssuanceStatus,
    /// Certificate key reserved by the first finalize attempt, reused by every retry
    pub certificate_key_pem: Option<String>,
    pub certificate: Option<CertificateMaterial>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DomainRecord {
    /// A fresh record waiting for its DNS challenge, retained for `ttl`
    pub fn new(
        domain: impl Into<String>,
        client_key_pem: impl Into<String>,
        authorization_json: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            domain: domain.into(),
            client_key_pem: client_key_pem.into(),
            authorization_json: authorization_json.into(),
            status: IssuanceStatus::WaitDnsAuthorization,
            certificate_key_pem: None,
            certificate: None,
            created_at,
            expires_at: created_at + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
