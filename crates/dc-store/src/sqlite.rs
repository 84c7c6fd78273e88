use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::record::{CertificateMaterial, DomainRecord, IssuanceStatus};
use crate::{DomainStore, validate_transition};

const SELECT_RECORD: &str = "SELECT domain, client_key_pem, authorization_json, status,
        private_key_pem, full_chain_pem, created_at, expires_at, certificate_key_pem
     FROM domains WHERE domain = ?1";

/// SQLite domain store (thread-safe via Mutex)
pub struct SqliteDomainStore {
    conn: Mutex<Connection>,
}

impl SqliteDomainStore {
    /// Open (or create) the database at `path`; `":memory:"` gives a private in-memory store
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS domains (
                domain TEXT PRIMARY KEY,
                client_key_pem TEXT NOT NULL,
                authorization_json TEXT NOT NULL,
                status TEXT NOT NULL,
                private_key_pem TEXT,
                full_chain_pem TEXT,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                certificate_key_pem TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_domains_status ON domains(status);
            CREATE INDEX IF NOT EXISTS idx_domains_expires_at ON domains(expires_at);",
        )?;
        add_missing_column(&conn, "certificate_key_pem", "TEXT")?;

        debug!(path = %path.display(), "Domain store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bring databases created before `column` existed up to date
fn add_missing_column(conn: &Connection, column: &str, decl: &str) -> StoreResult<()> {
    let exists = conn
        .prepare("SELECT 1 FROM pragma_table_info('domains') WHERE name = ?1")?
        .exists(params![column])?;
    if !exists {
        conn.execute_batch(&format!("ALTER TABLE domains ADD COLUMN {} {}", column, decl))?;
        info!(column, "Domain table migrated");
    }
    Ok(())
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", ms)))
}

struct RawRecord {
    domain: String,
    client_key_pem: String,
    authorization_json: String,
    status: String,
    private_key_pem: Option<String>,
    full_chain_pem: Option<String>,
    created_at: i64,
    expires_at: i64,
    certificate_key_pem: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            domain: row.get(0)?,
            client_key_pem: row.get(1)?,
            authorization_json: row.get(2)?,
            status: row.get(3)?,
            private_key_pem: row.get(4)?,
            full_chain_pem: row.get(5)?,
            created_at: row.get(6)?,
            expires_at: row.get(7)?,
            certificate_key_pem: row.get(8)?,
        })
    }

    fn into_record(self) -> StoreResult<DomainRecord> {
        let certificate = match (self.private_key_pem, self.full_chain_pem) {
            (Some(private_key_pem), Some(full_chain_pem)) => Some(CertificateMaterial {
                private_key_pem,
                full_chain_pem,
            }),
            _ => None,
        };

        Ok(DomainRecord {
            domain: self.domain,
            client_key_pem: self.client_key_pem,
            authorization_json: self.authorization_json,
            status: self.status.parse()?,
            certificate_key_pem: self.certificate_key_pem,
            certificate,
            created_at: from_millis(self.created_at)?,
            expires_at: from_millis(self.expires_at)?,
        })
    }
}

impl DomainStore for SqliteDomainStore {
    fn create_if_absent(&self, record: &DomainRecord) -> StoreResult<()> {
        let conn = self.conn();
        let result = conn.execute(
            "INSERT INTO domains (domain, client_key_pem, authorization_json, status,
                private_key_pem, full_chain_pem, created_at, expires_at, certificate_key_pem)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.domain,
                record.client_key_pem,
                record.authorization_json,
                record.status.as_str(),
                record.certificate.as_ref().map(|c| c.private_key_pem.as_str()),
                record.certificate.as_ref().map(|c| c.full_chain_pem.as_str()),
                to_millis(record.created_at),
                to_millis(record.expires_at),
                record.certificate_key_pem,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::DuplicateDomain(record.domain.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, domain: &str) -> StoreResult<Option<DomainRecord>> {
        let conn = self.conn();
        let raw = conn
            .query_row(SELECT_RECORD, params![domain], RawRecord::from_row)
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    fn advance_status(
        &self,
        domain: &str,
        expected: IssuanceStatus,
        next: IssuanceStatus,
        certificate: Option<&CertificateMaterial>,
    ) -> StoreResult<()> {
        validate_transition(expected, next, certificate)?;

        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE domains SET status = ?1, private_key_pem = ?2, full_chain_pem = ?3
             WHERE domain = ?4 AND status = ?5",
            params![
                next.as_str(),
                certificate.map(|c| c.private_key_pem.as_str()),
                certificate.map(|c| c.full_chain_pem.as_str()),
                domain,
                expected.as_str(),
            ],
        )?;

        if changed == 1 {
            debug!(domain = %domain, from = %expected, to = %next, "Status advanced");
            return Ok(());
        }

        let actual: Option<String> = conn
            .query_row(
                "SELECT status FROM domains WHERE domain = ?1",
                params![domain],
                |row| row.get(0),
            )
            .optional()?;

        match actual {
            None => Err(StoreError::NotFound(domain.to_string())),
            Some(actual) => Err(StoreError::StaleStatus {
                domain: domain.to_string(),
                expected,
                actual: actual.parse()?,
            }),
        }
    }

    fn reserve_certificate_key(&self, domain: &str, key_pem: &str) -> StoreResult<String> {
        let matched = IssuanceStatus::TextRecordMatched;
        let conn = self.conn();
        let reserved = conn.execute(
            "UPDATE domains SET certificate_key_pem = ?1
             WHERE domain = ?2 AND status = ?3 AND certificate_key_pem IS NULL",
            params![key_pem, domain, matched.as_str()],
        )?;
        if reserved == 1 {
            debug!(domain = %domain, "Certificate key reserved");
        }

        let row: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT status, certificate_key_pem FROM domains WHERE domain = ?1",
                params![domain],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            None => Err(StoreError::NotFound(domain.to_string())),
            Some((status, _)) if status != matched.as_str() => Err(StoreError::StaleStatus {
                domain: domain.to_string(),
                expected: matched,
                actual: status.parse()?,
            }),
            Some((_, Some(key))) => Ok(key),
            Some((_, None)) => Err(StoreError::Corrupt(format!(
                "no certificate key stored for {}",
                domain
            ))),
        }
    }

    fn list_pending(&self, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT domain FROM domains
             WHERE status != ?1 AND expires_at > ?2
             ORDER BY created_at, domain",
        )?;
        let domains = stmt
            .query_map(
                params![IssuanceStatus::Complete.as_str(), to_millis(now)],
                |row| row.get(0),
            )?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(domains)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM domains WHERE status != ?1 AND expires_at <= ?2",
            params![IssuanceStatus::Complete.as_str(), to_millis(now)],
        )?;
        if deleted > 0 {
            info!(count = deleted, "Purged expired domain records");
        }
        Ok(deleted)
    }
}
