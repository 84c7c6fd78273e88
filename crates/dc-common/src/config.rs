use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Main configuration, loaded from environment variables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// HTTP API port
    pub api_port: u16,
    /// Directory holding the domain record database
    pub data_dir: PathBuf,
    /// ACME directory URL; `None` picks Let's Encrypt production or staging
    pub acme_directory_url: Option<String>,
    /// Use the Let's Encrypt staging environment
    pub acme_staging: bool,
    /// Contact used for account registration when the request carries no email
    pub acme_email: Option<String>,
    /// Days before an unfinished domain record may be purged
    pub record_ttl_days: u32,
    /// Seconds between two scheduler passes over pending domains
    pub poll_interval_secs: u64,
    /// Nameservers queried for challenge records (empty = resolver defaults)
    pub dns_nameservers: Vec<IpAddr>,
    /// Per-query DNS timeout
    pub dns_timeout_secs: u64,
    /// Upper bound for one certificate finalization with the CA
    pub ca_timeout_secs: u64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            api_port: 4000,
            data_dir: PathBuf::from("/var/lib/dnscert"),
            acme_directory_url: None,
            acme_staging: false,
            acme_email: None,
            record_ttl_days: 30,
            poll_interval_secs: 60,
            dns_nameservers: Vec::new(),
            dns_timeout_secs: 5,
            ca_timeout_secs: 120,
        }
    }
}

impl EnvConfig {
    /// Load the configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("API_PORT") {
            if let Ok(port) = v.parse() {
                config.api_port = port;
            }
        }
        if let Ok(v) = std::env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ACME_DIRECTORY_URL") {
            if !v.is_empty() {
                config.acme_directory_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("ACME_STAGING") {
            config.acme_staging = v == "1" || v.to_lowercase() == "true";
        }
        if let Ok(v) = std::env::var("ACME_EMAIL") {
            if !v.is_empty() {
                config.acme_email = Some(v);
            }
        }
        if let Ok(v) = std::env::var("RECORD_TTL_DAYS") {
            if let Ok(days) = v.parse() {
                config.record_ttl_days = days;
            }
        }
        if let Ok(v) = std::env::var("POLL_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                config.poll_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("DNS_NAMESERVERS") {
            config.dns_nameservers = parse_nameservers(&v);
        }
        if let Ok(v) = std::env::var("DNS_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                config.dns_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("CA_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                config.ca_timeout_secs = secs;
            }
        }

        config
    }

    /// Load the .env file, then environment variables.
    ///
    /// Must run while the process is still single-threaded, before any async runtime exists.
    pub fn load(env_file: Option<&Path>) -> Self {
        if let Some(path) = env_file {
            load_dotenv(path);
        } else {
            let candidates = [PathBuf::from("/opt/dnscert/.env"), PathBuf::from(".env")];
            for candidate in &candidates {
                if candidate.exists() {
                    load_dotenv(candidate);
                    break;
                }
            }
        }

        Self::from_env()
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !self.directory_url().starts_with("https://") {
            return Err(AppError::Config(format!(
                "ACME directory URL must use https: {}",
                self.directory_url()
            )));
        }
        if self.poll_interval_secs == 0 {
            return Err(AppError::Config("POLL_INTERVAL_SECS must be positive".into()));
        }
        if self.dns_timeout_secs == 0 || self.ca_timeout_secs == 0 {
            return Err(AppError::Config("timeouts must be positive".into()));
        }
        if self.record_ttl_days == 0 {
            return Err(AppError::Config("RECORD_TTL_DAYS must be positive".into()));
        }
        Ok(())
    }

    /// Create the data directory and return the database path inside it
    pub fn prepare_database_path(&self) -> Result<PathBuf, AppError> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(self.data_dir.join("dnscert.db"))
    }

    pub fn directory_url(&self) -> &str {
        match &self.acme_directory_url {
            Some(url) => url,
            None if self.acme_staging => LETSENCRYPT_STAGING,
            None => LETSENCRYPT_PRODUCTION,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }

    pub fn ca_timeout(&self) -> Duration {
        Duration::from_secs(self.ca_timeout_secs)
    }
}

fn parse_nameservers(value: &str) -> Vec<IpAddr> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                tracing::warn!(nameserver = s, "Ignoring invalid nameserver address");
                None
            }
        })
        .collect()
}

/// Load a basic .env file (one KEY=VALUE per line)
fn load_dotenv(path: &Path) {
    if let Ok(content) = std::fs::read_to_string(path) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if std::env::var(key).is_err() {
                    // SAFETY: `load` runs before the tokio runtime is built, no other thread exists yet
                    unsafe { std::env::set_var(key, value) };
                }
            }
        }
    }
}
