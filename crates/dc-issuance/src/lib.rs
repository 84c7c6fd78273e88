//! dnscert issuance workflow
//!
//! Intake, DNS challenge verification and certificate finalization over the CA adapter,
//! the DNS verifier and the domain record store.

mod domain;
mod error;
mod orchestrator;
mod types;

pub use domain::{is_valid_domain, normalize_domain};
pub use error::{IssuanceError, IssuanceResult, Transition};
pub use orchestrator::Orchestrator;
pub use types::{DomainStatus, IntakeRequest, IntakeResponse, IssuanceSettings, TriggerPayload};
