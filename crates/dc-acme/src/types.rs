use dc_keys::KeyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The only challenge type this service can answer
pub const CHALLENGE_TYPE_DNS01: &str = "dns-01";

const BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

/// RFC 7807 problem document returned by the CA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Problem {
    pub fn is_bad_nonce(&self) -> bool {
        self.kind == BAD_NONCE
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({})", detail, self.kind),
            None => f.write_str(&self.kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

/// A CA authorization for one domain, as persisted with the domain record.
///
/// ACME v2 hands out authorizations through orders, so the order URL and its
/// finalize URL travel with the authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub url: String,
    pub order_url: String,
    pub finalize_url: String,
    pub identifier: Identifier,
    pub status: String,
    pub challenges: Vec<Challenge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
}

impl Authorization {
    pub fn to_json(&self) -> AcmeResult<String> {
        serde_json::to_string(self).map_err(|e| AcmeError::MalformedAuthorization(e.to_string()))
    }

    pub fn from_json(json: &str) -> AcmeResult<Self> {
        serde_json::from_str(json).map_err(|e| AcmeError::MalformedAuthorization(e.to_string()))
    }

    pub fn domain(&self) -> &str {
        &self.identifier.value
    }
}

#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("Account registration failed: {0}")]
    Registration(String),

    #[error("Authorization request failed: {0}")]
    Authorization(String),

    #[error("No dns-01 challenge offered for '{0}'")]
    NoSupportedChallenge(String),

    #[error("Certificate finalization failed: {0}")]
    Finalization(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed authorization: {0}")]
    MalformedAuthorization(String),

    #[error("ACME protocol error: {0}")]
    Protocol(String),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

impl AcmeError {
    /// Attribute a raw protocol failure to the operation it happened in
    pub(crate) fn during(self, stage: fn(String) -> AcmeError) -> AcmeError {
        match self {
            Self::Protocol(message) => stage(message),
            other => other,
        }
    }
}

impl From<reqwest::Error> for AcmeError {
    fn from(e: reqwest::Error) -> Self {
        AcmeError::Protocol(e.to_string())
    }
}

pub type AcmeResult<T> = Result<T, AcmeError>;
