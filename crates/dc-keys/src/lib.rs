//! Key material for dnscert
//!
//! RSA key pairs for ACME accounts and issued certificates, their PEM encoding,
//! certificate signing requests and certificate chain encoding.

use rand_core::OsRng;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::EncodePrivateKey;
use thiserror::Error;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;

pub use rsa::RsaPrivateKey;

/// PEM block type for PKCS#1 private keys
pub const PRIVATE_KEY_PEM_TAG: &str = "RSA PRIVATE KEY";
/// PEM block type for certificates
pub const CERTIFICATE_PEM_TAG: &str = "CERTIFICATE";

const RSA_KEY_BITS: usize = 2048;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Malformed key: {0}")]
    MalformedKey(String),

    #[error("Certificate request failed: {0}")]
    CertificateRequest(String),

    #[error("Malformed certificate chain: {0}")]
    MalformedChain(String),
}

pub type KeyResult<T> = Result<T, KeyError>;

/// Generate a new 2048-bit RSA key
pub fn generate_key_pair() -> KeyResult<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| KeyError::KeyGeneration(e.to_string()))
}

/// Encode a key as a PKCS#1 `RSA PRIVATE KEY` PEM block
pub fn encode_to_pem(key: &RsaPrivateKey) -> KeyResult<String> {
    let pem = key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| KeyError::KeyGeneration(format!("Failed to encode key: {}", e)))?;
    Ok(pem.to_string())
}

/// Decode the first PEM block of `input`, which must be an `RSA PRIVATE KEY`
pub fn decode_from_pem(input: &str) -> KeyResult<RsaPrivateKey> {
    let block = pem::parse(input)
        .map_err(|e| KeyError::MalformedKey(format!("failed to decode PEM block: {}", e)))?;

    if block.tag() != PRIVATE_KEY_PEM_TAG {
        return Err(KeyError::MalformedKey(format!(
            "unexpected PEM block type '{}'",
            block.tag()
        )));
    }

    RsaPrivateKey::from_pkcs1_der(block.contents())
        .map_err(|e| KeyError::MalformedKey(format!("invalid PKCS#1 key: {}", e)))
}

/// Build a DER-encoded PKCS#10 request for `domain`, signed with SHA-256/RSA
pub fn build_certificate_request(domain: &str, key: &RsaPrivateKey) -> KeyResult<Vec<u8>> {
    // rcgen cannot generate RSA keys, but signs with them once handed a PKCS#8 PEM
    let pkcs8 = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| KeyError::CertificateRequest(format!("Failed to encode key: {}", e)))?;
    let key_pair = KeyPair::from_pkcs8_pem_and_sign_algo(&pkcs8, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| KeyError::CertificateRequest(format!("Failed to load key: {}", e)))?;

    let mut params = CertificateParams::new(vec![domain.to_string()]).map_err(|e| {
        KeyError::CertificateRequest(format!("Failed to create params: {}", e))
    })?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| KeyError::CertificateRequest(format!("Failed to create CSR: {}", e)))?;

    Ok(csr.der().to_vec())
}

/// DER SubjectPublicKeyInfo carried by a PKCS#10 request
pub fn request_public_key(csr_der: &[u8]) -> KeyResult<Vec<u8>> {
    let (_, csr) = X509CertificationRequest::from_der(csr_der)
        .map_err(|e| KeyError::CertificateRequest(format!("Failed to parse CSR: {}", e)))?;
    Ok(csr.certification_request_info.subject_pki.raw.to_vec())
}

/// DER SubjectPublicKeyInfo of a certificate
pub fn certificate_public_key(certificate_der: &[u8]) -> KeyResult<Vec<u8>> {
    let (_, certificate) = x509_parser::parse_x509_certificate(certificate_der)
        .map_err(|e| KeyError::MalformedChain(format!("Failed to parse certificate: {}", e)))?;
    Ok(certificate.public_key().raw.to_vec())
}

/// Concatenate DER certificates as `CERTIFICATE` PEM blocks, keeping their order
pub fn encode_certificate_chain(certificates: &[Vec<u8>]) -> String {
    certificates
        .iter()
        .map(|der| {
            pem::encode_config(
                &pem::Pem::new(CERTIFICATE_PEM_TAG, der.clone()),
                pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
            )
        })
        .collect()
}

/// Split a PEM certificate chain into DER certificates
pub fn decode_certificate_chain(chain: &str) -> KeyResult<Vec<Vec<u8>>> {
    let blocks = pem::parse_many(chain).map_err(|e| KeyError::MalformedChain(e.to_string()))?;

    let mut certificates = Vec::with_capacity(blocks.len());
    for block in blocks {
        if block.tag() != CERTIFICATE_PEM_TAG {
            return Err(KeyError::MalformedChain(format!(
                "unexpected PEM block type '{}'",
                block.tag()
            )));
        }
        certificates.push(block.into_contents());
    }

    if certificates.is_empty() {
        return Err(KeyError::MalformedChain("no certificate in chain".into()));
    }
    Ok(certificates)
}
