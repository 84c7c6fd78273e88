//! dnscert ACME adapter
//!
//! Account registration, domain authorization and certificate finalization against an
//! RFC 8555 certificate authority, using RSA account keys and DNS-01 challenges only.

mod authority;
mod challenge;
mod client;
mod jws;
pub mod types;

pub use authority::{AcmeAuthority, CertificateAuthority};
pub use challenge::{compute_challenge_value, select_challenge};
pub use jws::AccountKey;
pub use types::{
    AcmeError, AcmeResult, Authorization, Challenge, Identifier, Problem, CHALLENGE_TYPE_DNS01,
};
