use async_trait::async_trait;
use dc_keys::RsaPrivateKey;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use crate::challenge::select_challenge;
use crate::client::{AcmeClient, AuthorizationResource};
use crate::jws::AccountKey;
use crate::types::{AcmeError, AcmeResult, Authorization};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Operations the issuance workflow needs from a certificate authority
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Register `key` as an account, accepting the terms of service. Idempotent.
    async fn register_account(&self, key: &RsaPrivateKey, contact: Option<&str>) -> AcmeResult<()>;

    /// Obtain a pending authorization for `domain`
    async fn request_authorization(
        &self,
        key: &RsaPrivateKey,
        domain: &str,
    ) -> AcmeResult<Authorization>;

    /// Answer the dns-01 challenge of `authz`, submit `csr` and wait for issuance.
    /// Returns the DER chain, leaf first.
    async fn finalize_certificate(
        &self,
        key: &RsaPrivateKey,
        csr: &[u8],
        authz: &Authorization,
        timeout: Duration,
    ) -> AcmeResult<Vec<Vec<u8>>>;
}

/// [`CertificateAuthority`] speaking ACME v2 to a directory URL
pub struct AcmeAuthority {
    client: AcmeClient,
    /// Account URL per JWK thumbprint
    accounts: Mutex<HashMap<String, String>>,
    poll_interval: Duration,
}

impl AcmeAuthority {
    pub fn new(directory_url: impl Into<String>) -> AcmeResult<Self> {
        Ok(Self {
            client: AcmeClient::new(directory_url)?,
            accounts: Mutex::new(HashMap::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn cached_account(&self, key: &AccountKey) -> Option<String> {
        self.accounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key.thumbprint())
            .cloned()
    }

    fn cache_account(&self, key: &AccountKey, kid: &str) {
        self.accounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.thumbprint().to_string(), kid.to_string());
    }

    /// Account URL for `key`, looked up at the CA when this process has not registered it
    async fn account_url(&self, key: &AccountKey) -> AcmeResult<String> {
        if let Some(kid) = self.cached_account(key) {
            return Ok(kid);
        }
        debug!(thumbprint = %key.thumbprint(), "Looking up existing ACME account");
        let kid = self.client.new_account(key, None, true).await?;
        self.cache_account(key, &kid);
        Ok(kid)
    }

    async fn authorize(&self, key: &RsaPrivateKey, domain: &str) -> AcmeResult<Authorization> {
        let account_key = AccountKey::new(key)?;
        let kid = self.account_url(&account_key).await?;

        let (order_url, order) = self.client.new_order(&account_key, &kid, domain).await?;
        let authz_url = order
            .authorizations
            .first()
            .cloned()
            .ok_or_else(|| AcmeError::Authorization(format!("order for {} has no authorization", domain)))?;

        let resource = self
            .client
            .fetch_authorization(&account_key, &kid, &authz_url)
            .await?;

        Ok(Authorization {
            url: authz_url,
            order_url,
            finalize_url: order.finalize,
            identifier: resource.identifier,
            status: resource.status,
            challenges: resource.challenges,
            expires: resource.expires,
        })
    }

    async fn wait_for_validation(
        &self,
        key: &AccountKey,
        kid: &str,
        authz: &Authorization,
    ) -> AcmeResult<()> {
        let challenge = select_challenge(authz)?;
        let mut state = self.client.fetch_authorization(key, kid, &authz.url).await?;

        if state.status == "pending" {
            debug!(domain = %authz.domain(), "Answering dns-01 challenge");
            self.client.respond_challenge(key, kid, &challenge.url).await?;
        }

        loop {
            match state.status.as_str() {
                "valid" => return Ok(()),
                "invalid" | "deactivated" | "expired" | "revoked" => {
                    return Err(AcmeError::Finalization(format!(
                        "authorization for {} is {}: {}",
                        authz.domain(),
                        state.status,
                        challenge_problem(&state)
                    )));
                }
                status => {
                    debug!(domain = %authz.domain(), status = %status, "Authorization not validated yet");
                    tokio::time::sleep(self.poll_interval).await;
                    state = self.client.fetch_authorization(key, kid, &authz.url).await?;
                }
            }
        }
    }

    async fn finalize(
        &self,
        key: &RsaPrivateKey,
        csr: &[u8],
        authz: &Authorization,
    ) -> AcmeResult<Vec<Vec<u8>>> {
        let account_key = AccountKey::new(key)?;
        let kid = self.account_url(&account_key).await?;

        self.wait_for_validation(&account_key, &kid, authz).await?;

        let mut order = self
            .client
            .fetch_order(&account_key, &kid, &authz.order_url)
            .await?;
        let mut submitted = false;
        loop {
            match order.status.as_str() {
                "valid" => break,
                "ready" if !submitted => {
                    debug!(domain = %authz.domain(), "Submitting CSR");
                    order = self
                        .client
                        .finalize_order(&account_key, &kid, &authz.finalize_url, csr)
                        .await?;
                    submitted = true;
                }
                "invalid" => {
                    let reason = order
                        .error
                        .as_ref()
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "no reason given".to_string());
                    return Err(AcmeError::Finalization(format!(
                        "order for {} is invalid: {}",
                        authz.domain(),
                        reason
                    )));
                }
                status => {
                    debug!(domain = %authz.domain(), status = %status, "Order not issued yet");
                    tokio::time::sleep(self.poll_interval).await;
                    order = self
                        .client
                        .fetch_order(&account_key, &kid, &authz.order_url)
                        .await?;
                }
            }
        }

        let certificate_url = order.certificate.ok_or_else(|| {
            AcmeError::Finalization(format!(
                "order for {} is valid but has no certificate URL",
                authz.domain()
            ))
        })?;

        let chain = self
            .client
            .download_certificate(&account_key, &kid, &certificate_url)
            .await?;

        // A retried finalize can land on an order issued for an earlier CSR
        ensure_leaf_matches_request(authz.domain(), &chain, csr)?;
        Ok(chain)
    }
}

fn ensure_leaf_matches_request(domain: &str, chain: &[Vec<u8>], csr: &[u8]) -> AcmeResult<()> {
    let leaf = chain.first().ok_or_else(|| {
        AcmeError::Finalization(format!("empty certificate chain for {}", domain))
    })?;

    if dc_keys::certificate_public_key(leaf)? != dc_keys::request_public_key(csr)? {
        return Err(AcmeError::Finalization(format!(
            "certificate for {} was issued for a different key than the submitted CSR",
            domain
        )));
    }
    Ok(())
}

fn challenge_problem(state: &AuthorizationResource) -> String {
    state
        .challenges
        .iter()
        .find_map(|c| c.error.as_ref())
        .map(|p| p.to_string())
        .unwrap_or_else(|| "no reason given".to_string())
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    async fn register_account(&self, key: &RsaPrivateKey, contact: Option<&str>) -> AcmeResult<()> {
        let account_key = AccountKey::new(key)?;
        let kid = self
            .client
            .new_account(&account_key, contact, false)
            .await
            .map_err(|e| e.during(AcmeError::Registration))?;

        info!(account = %kid, "ACME account registered");
        self.cache_account(&account_key, &kid);
        Ok(())
    }

    async fn request_authorization(
        &self,
        key: &RsaPrivateKey,
        domain: &str,
    ) -> AcmeResult<Authorization> {
        let authz = self
            .authorize(key, domain)
            .await
            .map_err(|e| e.during(AcmeError::Authorization))?;

        info!(domain = %domain, status = %authz.status, "ACME authorization obtained");
        Ok(authz)
    }

    async fn finalize_certificate(
        &self,
        key: &RsaPrivateKey,
        csr: &[u8],
        authz: &Authorization,
        timeout: Duration,
    ) -> AcmeResult<Vec<Vec<u8>>> {
        let chain = tokio::time::timeout(timeout, self.finalize(key, csr, authz))
            .await
            .map_err(|_| AcmeError::Timeout(timeout))?
            .map_err(|e| e.during(AcmeError::Finalization))?;

        info!(domain = %authz.domain(), certificates = chain.len(), "Certificate issued");
        Ok(chain)
    }
}
