use dc_common::config::EnvConfig;
use dc_store::{DomainRecord, IssuanceStatus};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Certificate request submitted by a client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntakeRequest {
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub agree_tos: bool,
    /// PKCS#1 PEM account key; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

/// What the client must publish, and the account key it now owns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeResponse {
    pub client_key: String,
    pub dns_record_key: String,
    pub dns_record_value: String,
    pub dns_record_type: String,
}

/// Domain record snapshot carried by the poll and finalize triggers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPayload {
    pub domain: String,
    #[serde(default)]
    pub client_key: String,
    #[serde(default)]
    pub authorization: String,
    #[serde(default)]
    pub status: String,
}

impl TriggerPayload {
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Default::default()
        }
    }
}

impl From<&DomainRecord> for TriggerPayload {
    fn from(record: &DomainRecord) -> Self {
        Self {
            domain: record.domain.clone(),
            client_key: record.client_key_pem.clone(),
            authorization: record.authorization_json.clone(),
            status: record.status.to_string(),
        }
    }
}

/// Public view of a domain record; certificate material only once complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainStatus {
    pub domain: String,
    pub status: IssuanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_chain_pem: Option<String>,
}

impl From<DomainRecord> for DomainStatus {
    fn from(record: DomainRecord) -> Self {
        let (private_key, full_chain_pem) = match record.certificate {
            Some(c) if record.status.is_complete() => {
                (Some(c.private_key_pem), Some(c.full_chain_pem))
            }
            _ => (None, None),
        };
        Self {
            domain: record.domain,
            status: record.status,
            private_key,
            full_chain_pem,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssuanceSettings {
    /// Retention of a record after creation
    pub record_ttl: chrono::Duration,
    /// Upper bound on one finalization with the CA
    pub ca_timeout: Duration,
    /// Account contact used when the request has no email
    pub default_contact: Option<String>,
}

impl Default for IssuanceSettings {
    fn default() -> Self {
        Self {
            record_ttl: chrono::Duration::days(30),
            ca_timeout: Duration::from_secs(120),
            default_contact: None,
        }
    }
}

impl From<&EnvConfig> for IssuanceSettings {
    fn from(config: &EnvConfig) -> Self {
        Self {
            record_ttl: chrono::Duration::days(i64::from(config.record_ttl_days)),
            ca_timeout: config.ca_timeout(),
            default_contact: config.acme_email.clone(),
        }
    }
}
