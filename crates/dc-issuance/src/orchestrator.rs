use chrono::Utc;
use dc_acme::{AccountKey, Authorization, CertificateAuthority, compute_challenge_value, select_challenge};
use dc_common::events::IssuanceEvent;
use dc_dns::{DNS_RECORD_TYPE, DnsVerifier, challenge_record_name};
use dc_keys::RsaPrivateKey;
use dc_store::{
    CertificateMaterial, DomainRecord, DomainStore, IssuanceStatus, StoreError, StoreResult,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::domain::{is_valid_domain, normalize_domain};
use crate::error::{IssuanceError, IssuanceResult, Transition};
use crate::types::{DomainStatus, IntakeRequest, IntakeResponse, IssuanceSettings, TriggerPayload};

/// Drives domain records through WaitDnsAuthorization -> TextRecordMatched -> Complete.
///
/// Every operation reads the record, talks to the CA or DNS, and persists with a
/// compare-and-set on the status it started from. Invocations hold no state of their own
/// and are safe to repeat.
pub struct Orchestrator {
    ca: Arc<dyn CertificateAuthority>,
    store: Arc<dyn DomainStore>,
    dns: DnsVerifier,
    events: Option<broadcast::Sender<IssuanceEvent>>,
    settings: IssuanceSettings,
}

impl Orchestrator {
    pub fn new(
        ca: Arc<dyn CertificateAuthority>,
        store: Arc<dyn DomainStore>,
        dns: DnsVerifier,
        settings: IssuanceSettings,
    ) -> Self {
        Self {
            ca,
            store,
            dns,
            events: None,
            settings,
        }
    }

    /// Publish lifecycle events on `tx`
    pub fn with_events(mut self, tx: broadcast::Sender<IssuanceEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, event: IssuanceEvent) {
        if let Some(tx) = &self.events {
            // No subscribers is fine
            let _ = tx.send(event);
        }
    }

    fn load(&self, domain: &str) -> IssuanceResult<DomainRecord> {
        self.store
            .get(domain)
            .map_err(|e| IssuanceError::store(domain, e))?
            .ok_or_else(|| IssuanceError::NotFound {
                domain: domain.to_string(),
            })
    }

    fn client_key(record: &DomainRecord) -> IssuanceResult<RsaPrivateKey> {
        dc_keys::decode_from_pem(&record.client_key_pem).map_err(|source| {
            IssuanceError::MalformedKey {
                domain: record.domain.clone(),
                source,
            }
        })
    }

    fn authorization(record: &DomainRecord, transition: Transition) -> IssuanceResult<Authorization> {
        Authorization::from_json(&record.authorization_json)
            .map_err(|e| IssuanceError::ca(&record.domain, transition, e))
    }

    /// Key the certificate is requested for. The first attempt reserves it on the record so
    /// that retries and concurrent calls submit the same public key.
    async fn certificate_key(&self, record: &DomainRecord) -> IssuanceResult<RsaPrivateKey> {
        let domain = record.domain.as_str();
        let pem = match &record.certificate_key_pem {
            Some(pem) => pem.clone(),
            None => {
                let candidate = generate_key(domain).await?;
                let candidate_pem = dc_keys::encode_to_pem(&candidate).map_err(|source| {
                    IssuanceError::Key {
                        domain: domain.to_string(),
                        source,
                    }
                })?;
                self.store
                    .reserve_certificate_key(domain, &candidate_pem)
                    .map_err(|e| IssuanceError::store(domain, e))?
            }
        };

        dc_keys::decode_from_pem(&pem).map_err(|source| IssuanceError::MalformedKey {
            domain: domain.to_string(),
            source,
        })
    }

    /// Expected TXT value for `authz` under `key`
    fn challenge_value(
        domain: &str,
        key: &RsaPrivateKey,
        authz: &Authorization,
        transition: Transition,
    ) -> IssuanceResult<String> {
        let challenge =
            select_challenge(authz).map_err(|e| IssuanceError::ca(domain, transition, e))?;
        let account_key =
            AccountKey::new(key).map_err(|e| IssuanceError::ca(domain, transition, e))?;
        Ok(compute_challenge_value(&account_key, challenge))
    }

    /// Register the client with the CA, authorize the domain and persist a new record.
    /// Nothing is persisted unless every CA step succeeded.
    pub async fn intake(&self, request: IntakeRequest) -> IssuanceResult<IntakeResponse> {
        let domain = normalize_domain(&request.domain);

        if !request.agree_tos {
            return Err(IssuanceError::TermsNotAccepted { domain });
        }
        if !is_valid_domain(&domain) {
            return Err(IssuanceError::InvalidDomain { domain });
        }

        let existing = self
            .store
            .get(&domain)
            .map_err(|e| IssuanceError::store(&domain, e))?;
        if existing.is_some() {
            return Err(IssuanceError::DuplicateDomain { domain });
        }

        let (key, client_key_pem) = match request.client_key.filter(|k| !k.trim().is_empty()) {
            Some(pem) => {
                let key = dc_keys::decode_from_pem(&pem).map_err(|source| {
                    IssuanceError::MalformedKey {
                        domain: domain.clone(),
                        source,
                    }
                })?;
                (key, pem)
            }
            None => {
                let key = generate_key(&domain).await?;
                let pem = dc_keys::encode_to_pem(&key).map_err(|source| IssuanceError::Key {
                    domain: domain.clone(),
                    source,
                })?;
                (key, pem)
            }
        };

        let contact = request
            .email
            .filter(|e| !e.trim().is_empty())
            .or_else(|| self.settings.default_contact.clone());

        self.ca
            .register_account(&key, contact.as_deref())
            .await
            .map_err(|e| IssuanceError::ca(&domain, Transition::Intake, e))?;
        let authz = self
            .ca
            .request_authorization(&key, &domain)
            .await
            .map_err(|e| IssuanceError::ca(&domain, Transition::Intake, e))?;

        let dns_record_value = Self::challenge_value(&domain, &key, &authz, Transition::Intake)?;
        let authorization_json = authz
            .to_json()
            .map_err(|e| IssuanceError::ca(&domain, Transition::Intake, e))?;

        let record = DomainRecord::new(
            domain.clone(),
            client_key_pem.clone(),
            authorization_json,
            self.settings.record_ttl,
        );
        self.store
            .create_if_absent(&record)
            .map_err(|e| IssuanceError::store(&domain, e))?;

        info!(domain = %domain, "Certificate request accepted, waiting for DNS challenge");
        self.emit(IssuanceEvent::RecordCreated {
            domain: domain.clone(),
        });

        Ok(IntakeResponse {
            client_key: client_key_pem,
            dns_record_key: challenge_record_name(&domain),
            dns_record_value,
            dns_record_type: DNS_RECORD_TYPE.to_string(),
        })
    }

    /// Poll trigger: advance to TextRecordMatched once the challenge value is published.
    /// Returns the record as it stands afterwards.
    pub async fn check_text_record(&self, payload: TriggerPayload) -> IssuanceResult<TriggerPayload> {
        let domain = normalize_domain(&payload.domain);
        self.verify(&domain).await?;
        Ok(TriggerPayload::from(&self.load(&domain)?))
    }

    async fn verify(&self, domain: &str) -> IssuanceResult<IssuanceStatus> {
        let record = self.load(domain)?;
        if record.status != IssuanceStatus::WaitDnsAuthorization {
            debug!(domain = %domain, status = %record.status, "Text record already verified");
            return Ok(record.status);
        }

        let key = Self::client_key(&record)?;
        let authz = Self::authorization(&record, Transition::VerifyTextRecord)?;
        let expected = Self::challenge_value(domain, &key, &authz, Transition::VerifyTextRecord)?;

        if !self.dns.verify_challenge(domain, &expected).await {
            return Ok(IssuanceStatus::WaitDnsAuthorization);
        }

        match self.store.advance_status(
            domain,
            IssuanceStatus::WaitDnsAuthorization,
            IssuanceStatus::TextRecordMatched,
            None,
        ) {
            Ok(()) => {
                info!(domain = %domain, "DNS challenge record matched");
                self.emit(IssuanceEvent::TextRecordMatched {
                    domain: domain.to_string(),
                });
                Ok(IssuanceStatus::TextRecordMatched)
            }
            Err(StoreError::StaleStatus { actual, .. }) => {
                info!(domain = %domain, status = %actual, "Text record verified concurrently");
                Ok(actual)
            }
            Err(e) => Err(IssuanceError::store(domain, e)),
        }
    }

    /// Finalize trigger: obtain the certificate for a matched domain and complete the record.
    /// A CA failure leaves the record at TextRecordMatched for a later retry.
    pub async fn create_certificate(&self, payload: TriggerPayload) -> IssuanceResult<()> {
        let domain = normalize_domain(&payload.domain);
        self.finalize(&domain).await
    }

    async fn finalize(&self, domain: &str) -> IssuanceResult<()> {
        let record = self.load(domain)?;
        match record.status {
            IssuanceStatus::Complete => {
                debug!(domain = %domain, "Certificate already issued");
                return Ok(());
            }
            IssuanceStatus::WaitDnsAuthorization => {
                return Err(IssuanceError::NotReady {
                    domain: domain.to_string(),
                    status: record.status,
                });
            }
            IssuanceStatus::TextRecordMatched => {}
        }

        let client_key = Self::client_key(&record)?;
        let authz = Self::authorization(&record, Transition::Finalize)?;

        let certificate_key = match self.certificate_key(&record).await {
            Ok(key) => key,
            Err(IssuanceError::StaleStatus {
                actual: IssuanceStatus::Complete,
                ..
            }) => {
                debug!(domain = %domain, "Certificate issued concurrently");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let csr = dc_keys::build_certificate_request(domain, &certificate_key).map_err(|source| {
            IssuanceError::Key {
                domain: domain.to_string(),
                source,
            }
        })?;

        let chain = match self
            .ca
            .finalize_certificate(&client_key, &csr, &authz, self.settings.ca_timeout)
            .await
        {
            Ok(chain) => chain,
            Err(e) => {
                error!(domain = %domain, error = %e, "Certificate finalization failed");
                self.emit(IssuanceEvent::FinalizeFailed {
                    domain: domain.to_string(),
                    error: e.to_string(),
                });
                return Err(IssuanceError::ca(domain, Transition::Finalize, e));
            }
        };

        let material = CertificateMaterial {
            private_key_pem: dc_keys::encode_to_pem(&certificate_key).map_err(|source| {
                IssuanceError::Key {
                    domain: domain.to_string(),
                    source,
                }
            })?,
            full_chain_pem: dc_keys::encode_certificate_chain(&chain),
        };

        match self.store.advance_status(
            domain,
            IssuanceStatus::TextRecordMatched,
            IssuanceStatus::Complete,
            Some(&material),
        ) {
            Ok(()) => {
                info!(domain = %domain, certificates = chain.len(), "Certificate stored");
                self.emit(IssuanceEvent::Completed {
                    domain: domain.to_string(),
                });
                Ok(())
            }
            Err(StoreError::StaleStatus {
                actual: IssuanceStatus::Complete,
                ..
            }) => {
                warn!(domain = %domain, "Certificate issued concurrently, discarding this one");
                Ok(())
            }
            Err(e) => Err(IssuanceError::store(domain, e)),
        }
    }

    /// One scheduler pass for `domain`: verify the TXT record, then finalize if it matched
    pub async fn advance(&self, domain: &str) -> IssuanceResult<IssuanceStatus> {
        let domain = normalize_domain(domain);
        match self.verify(&domain).await? {
            IssuanceStatus::TextRecordMatched => {
                self.finalize(&domain).await?;
                Ok(IssuanceStatus::Complete)
            }
            status => Ok(status),
        }
    }

    pub fn status(&self, domain: &str) -> IssuanceResult<DomainStatus> {
        let domain = normalize_domain(domain);
        Ok(DomainStatus::from(self.load(&domain)?))
    }

    /// Domains still waiting on DNS or the CA
    pub fn pending_domains(&self) -> StoreResult<Vec<String>> {
        self.store.list_pending(Utc::now())
    }

    /// Drop incomplete records past their retention deadline
    pub fn purge_expired(&self) -> StoreResult<usize> {
        self.store.purge_expired(Utc::now())
    }
}

/// RSA generation is CPU-bound; keep it off the async workers
async fn generate_key(domain: &str) -> IssuanceResult<RsaPrivateKey> {
    let result = tokio::task::spawn_blocking(dc_keys::generate_key_pair)
        .await
        .map_err(|e| dc_keys::KeyError::KeyGeneration(e.to_string()))
        .and_then(|r| r);

    result.map_err(|source| IssuanceError::Key {
        domain: domain.to_string(),
        source,
    })
}
