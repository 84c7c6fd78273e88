//! DNS verification of published ACME challenge values

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Label prepended to the domain for the challenge record
pub const CHALLENGE_RECORD_PREFIX: &str = "_acme-challenge.";
/// Record type the client must publish
pub const DNS_RECORD_TYPE: &str = "TXT";

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("TXT lookup for '{name}' failed: {reason}")]
    Lookup { name: String, reason: String },
}

pub type DnsResult<T> = Result<T, DnsError>;

/// Name of the TXT record holding the challenge value for `domain`
pub fn challenge_record_name(domain: &str) -> String {
    format!("{}{}", CHALLENGE_RECORD_PREFIX, domain)
}

/// Source of TXT records
#[async_trait]
pub trait TxtLookup: Send + Sync {
    /// All TXT values published at `name`, multi-string data concatenated
    async fn lookup_txt(&self, name: &str) -> DnsResult<Vec<String>>;
}

/// [`TxtLookup`] over hickory with caching disabled, so repeated polls see propagation
pub struct HickoryTxtLookup {
    resolver: TokioResolver,
}

impl HickoryTxtLookup {
    /// Query `nameservers` over UDP, or the system resolvers when the list is empty
    pub fn new(nameservers: &[IpAddr], timeout: Duration) -> Self {
        let config = if nameservers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut config = ResolverConfig::new();
            for ip in nameservers {
                config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(*ip, 53),
                    Protocol::Udp,
                ));
            }
            config
        };

        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 2;
        opts.cache_size = 0;

        let resolver = Resolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build();

        Self { resolver }
    }
}

#[async_trait]
impl TxtLookup for HickoryTxtLookup {
    async fn lookup_txt(&self, name: &str) -> DnsResult<Vec<String>> {
        // Fully qualified, so no search domain is appended
        let fqdn = if name.ends_with('.') {
            name.to_string()
        } else {
            format!("{}.", name)
        };

        let lookup = self
            .resolver
            .txt_lookup(fqdn.as_str())
            .await
            .map_err(|e| DnsError::Lookup {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|data| String::from_utf8_lossy(data))
                    .collect::<String>()
            })
            .collect())
    }
}

/// Checks that a domain publishes its expected challenge value
#[derive(Clone)]
pub struct DnsVerifier {
    lookup: Arc<dyn TxtLookup>,
}

impl DnsVerifier {
    pub fn new(lookup: Arc<dyn TxtLookup>) -> Self {
        Self { lookup }
    }

    /// True iff some TXT value at the challenge record equals `expected` exactly.
    /// Lookup failures count as "not yet published".
    pub async fn verify_challenge(&self, domain: &str, expected: &str) -> bool {
        let name = challenge_record_name(domain);
        match self.lookup.lookup_txt(&name).await {
            Ok(values) => {
                trace!(record = %name, found = ?values, "TXT lookup");
                let matched = values.iter().any(|v| v == expected);
                if !matched {
                    debug!(record = %name, "Challenge value not published yet");
                }
                matched
            }
            Err(e) => {
                debug!(record = %name, error = %e, "TXT lookup failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StaticLookup {
        records: HashMap<String, Vec<String>>,
    }

    impl StaticLookup {
        fn with(name: &str, values: &[&str]) -> Arc<Self> {
            let mut records = HashMap::new();
            records.insert(
                name.to_string(),
                values.iter().map(|v| v.to_string()).collect(),
            );
            Arc::new(Self { records })
        }
    }

    #[async_trait]
    impl TxtLookup for StaticLookup {
        async fn lookup_txt(&self, name: &str) -> DnsResult<Vec<String>> {
            self.records.get(name).cloned().ok_or_else(|| DnsError::Lookup {
                name: name.to_string(),
                reason: "NXDOMAIN".to_string(),
            })
        }
    }

    #[test]
    fn test_challenge_record_name() {
        assert_eq!(
            challenge_record_name("example.com"),
            "_acme-challenge.example.com"
        );
    }

    #[tokio::test]
    async fn test_verify_exact_match() {
        let verifier = DnsVerifier::new(StaticLookup::with(
            "_acme-challenge.example.com",
            &["unrelated", "abc-DEF_123"],
        ));
        assert!(verifier.verify_challenge("example.com", "abc-DEF_123").await);
    }

    #[tokio::test]
    async fn test_verify_is_case_sensitive() {
        let verifier = DnsVerifier::new(StaticLookup::with(
            "_acme-challenge.example.com",
            &["abc-DEF_123"],
        ));
        assert!(!verifier.verify_challenge("example.com", "ABC-def_123").await);
        assert!(!verifier.verify_challenge("example.com", "abc-DEF_12").await);
    }

    #[tokio::test]
    async fn test_verify_lookup_failure_is_false() {
        let verifier = DnsVerifier::new(StaticLookup::with("_acme-challenge.other.com", &["x"]));
        assert!(!verifier.verify_challenge("example.com", "x").await);
    }

    #[tokio::test]
    async fn test_verify_no_values() {
        let verifier = DnsVerifier::new(StaticLookup::with("_acme-challenge.example.com", &[]));
        assert!(!verifier.verify_challenge("example.com", "x").await);
    }
}
