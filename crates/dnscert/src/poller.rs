use dc_common::events::IssuanceEvent;
use dc_issuance::Orchestrator;
use dc_store::IssuanceStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

/// Periodically advances every pending domain.
///
/// A pass runs every `interval`, right after a record is created, or when woken explicitly.
pub struct Poller {
    orchestrator: Arc<Orchestrator>,
    events: broadcast::Sender<IssuanceEvent>,
    interval: Duration,
    wake: Arc<Notify>,
}

impl Poller {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        events: broadcast::Sender<IssuanceEvent>,
        interval: Duration,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            orchestrator,
            events,
            interval,
            wake,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut rx = self.events.subscribe();
        info!(interval_secs = self.interval.as_secs(), "Issuance poller started");

        loop {
            self.pass().await;
            wait_for_trigger(&mut rx, self.interval, &self.wake).await?;
        }
    }

    async fn pass(&self) {
        match self.orchestrator.purge_expired() {
            Ok(0) => {}
            Ok(count) => info!(count, "Expired domain records purged"),
            Err(e) => warn!(error = %e, "Failed to purge expired records"),
        }

        let domains = match self.orchestrator.pending_domains() {
            Ok(domains) => domains,
            Err(e) => {
                error!(error = %e, "Failed to list pending domains");
                return;
            }
        };

        for domain in domains {
            match self.orchestrator.advance(&domain).await {
                Ok(IssuanceStatus::Complete) => info!(domain = %domain, "Issuance complete"),
                Ok(status) => debug!(domain = %domain, status = %status, "Domain still pending"),
                Err(e) if e.is_benign() => info!(domain = %domain, error = %e, "Concurrent update"),
                Err(e) => warn!(domain = %domain, error = %e, "Issuance step failed, retrying next pass"),
            }
        }
    }
}

/// Resolve when the next pass is due
async fn wait_for_trigger(
    rx: &mut broadcast::Receiver<IssuanceEvent>,
    interval: Duration,
    wake: &Notify,
) -> anyhow::Result<()> {
    let sleep = tokio::time::sleep(interval);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return Ok(()),
            _ = wake.notified() => {
                debug!("Poll pass requested");
                return Ok(());
            }
            event = rx.recv() => match event {
                Ok(IssuanceEvent::RecordCreated { domain }) => {
                    debug!(domain = %domain, "New record, polling now");
                    return Ok(());
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Poller lagged behind issuance events");
                    return Ok(());
                }
                Err(RecvError::Closed) => anyhow::bail!("issuance event bus closed"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dc_acme::{AcmeError, AcmeResult, Authorization, CertificateAuthority, Challenge, Identifier};
    use dc_dns::{DnsError, DnsResult, DnsVerifier, TxtLookup};
    use dc_issuance::{IntakeRequest, IntakeResponse, IssuanceSettings};
    use dc_keys::RsaPrivateKey;
    use dc_store::{DomainRecord, DomainStore, SqliteDomainStore};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Authorizes anything, refuses to issue for one domain
    struct StubCa {
        refused: &'static str,
    }

    #[async_trait]
    impl CertificateAuthority for StubCa {
        async fn register_account(&self, _key: &RsaPrivateKey, _contact: Option<&str>) -> AcmeResult<()> {
            Ok(())
        }

        async fn request_authorization(
            &self,
            _key: &RsaPrivateKey,
            domain: &str,
        ) -> AcmeResult<Authorization> {
            Ok(Authorization {
                url: format!("https://ca.test/authz/{}", domain),
                order_url: format!("https://ca.test/order/{}", domain),
                finalize_url: format!("https://ca.test/order/{}/finalize", domain),
                identifier: Identifier {
                    kind: "dns".into(),
                    value: domain.into(),
                },
                status: "pending".into(),
                challenges: vec![Challenge {
                    kind: "dns-01".into(),
                    url: format!("https://ca.test/chall/{}", domain),
                    token: format!("token-{}", domain),
                    status: "pending".into(),
                    error: None,
                }],
                expires: None,
            })
        }

        async fn finalize_certificate(
            &self,
            _key: &RsaPrivateKey,
            _csr: &[u8],
            authz: &Authorization,
            _timeout: Duration,
        ) -> AcmeResult<Vec<Vec<u8>>> {
            if authz.domain() == self.refused {
                return Err(AcmeError::Finalization("order is invalid".into()));
            }
            Ok(vec![b"leaf".to_vec()])
        }
    }

    #[derive(Default)]
    struct StubDns {
        records: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl TxtLookup for StubDns {
        async fn lookup_txt(&self, name: &str) -> DnsResult<Vec<String>> {
            self.records
                .lock()
                .unwrap()
                .get(name)
                .map(|value| vec![value.clone()])
                .ok_or_else(|| DnsError::Lookup {
                    name: name.to_string(),
                    reason: "NXDOMAIN".into(),
                })
        }
    }

    struct Fixture {
        poller: Poller,
        orchestrator: Arc<Orchestrator>,
        store: Arc<SqliteDomainStore>,
        dns: Arc<StubDns>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteDomainStore::open(":memory:").unwrap());
        let dns = Arc::new(StubDns::default());
        let (events, _) = broadcast::channel(16);

        let orchestrator = Arc::new(
            Orchestrator::new(
                Arc::new(StubCa {
                    refused: "broken.com",
                }),
                store.clone(),
                DnsVerifier::new(dns.clone()),
                IssuanceSettings::default(),
            )
            .with_events(events.clone()),
        );
        let poller = Poller::new(
            orchestrator.clone(),
            events,
            Duration::from_secs(60),
            Arc::new(Notify::new()),
        );

        Fixture {
            poller,
            orchestrator,
            store,
            dns,
        }
    }

    /// Intake `domain`, optionally publishing its TXT record
    async fn intake(f: &Fixture, domain: &str, publish: bool) -> IntakeResponse {
        let response = f
            .orchestrator
            .intake(IntakeRequest {
                domain: domain.into(),
                agree_tos: true,
                ..Default::default()
            })
            .await
            .unwrap();
        if publish {
            publish_record(f, &response);
        }
        response
    }

    fn publish_record(f: &Fixture, response: &IntakeResponse) {
        f.dns.records.lock().unwrap().insert(
            response.dns_record_key.clone(),
            response.dns_record_value.clone(),
        );
    }

    fn status_of(f: &Fixture, domain: &str) -> IssuanceStatus {
        f.store.get(domain).unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_pass_advances_every_pending_domain() {
        let f = fixture();
        intake(&f, "broken.com", true).await;
        intake(&f, "ready.com", true).await;
        intake(&f, "waiting.com", false).await;
        f.store
            .create_if_absent(&DomainRecord::new(
                "stale.com",
                "client-key",
                "{}",
                chrono::Duration::seconds(-1),
            ))
            .unwrap();

        f.poller.pass().await;

        assert!(f.store.get("stale.com").unwrap().is_none());
        assert_eq!(status_of(&f, "ready.com"), IssuanceStatus::Complete);
        assert_eq!(status_of(&f, "waiting.com"), IssuanceStatus::WaitDnsAuthorization);
        // A refused finalize does not stop the pass and is retried later
        assert_eq!(status_of(&f, "broken.com"), IssuanceStatus::TextRecordMatched);
        assert_eq!(
            f.orchestrator.pending_domains().unwrap(),
            vec!["broken.com".to_string(), "waiting.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_later_pass_picks_up_published_record() {
        let f = fixture();
        let response = intake(&f, "waiting.com", false).await;

        f.poller.pass().await;
        assert_eq!(status_of(&f, "waiting.com"), IssuanceStatus::WaitDnsAuthorization);

        publish_record(&f, &response);

        f.poller.pass().await;
        assert_eq!(status_of(&f, "waiting.com"), IssuanceStatus::Complete);
        assert!(f.orchestrator.pending_domains().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wakes_on_interval() {
        let (tx, mut rx) = broadcast::channel(8);
        let wake = Notify::new();

        wait_for_trigger(&mut rx, Duration::from_secs(60), &wake)
            .await
            .unwrap();
        drop(tx);
    }

    #[tokio::test]
    async fn test_wakes_on_record_created() {
        let (tx, mut rx) = broadcast::channel(8);
        let wake = Notify::new();

        tx.send(IssuanceEvent::Completed {
            domain: "other.com".into(),
        })
        .unwrap();
        tx.send(IssuanceEvent::RecordCreated {
            domain: "example.com".into(),
        })
        .unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_trigger(&mut rx, Duration::from_secs(3600), &wake),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wakes_on_notify() {
        let (_tx, mut rx) = broadcast::channel::<IssuanceEvent>(8);
        let wake = Notify::new();
        wake.notify_one();

        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_trigger(&mut rx, Duration::from_secs(3600), &wake),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_closed_bus_is_an_error() {
        let (tx, mut rx) = broadcast::channel::<IssuanceEvent>(8);
        drop(tx);
        let wake = Notify::new();

        assert!(
            wait_for_trigger(&mut rx, Duration::from_secs(3600), &wake)
                .await
                .is_err()
        );
    }
}
