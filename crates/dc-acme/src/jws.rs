use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rsa::pkcs1v15::SigningKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::types::{AcmeError, AcmeResult};

const ALGORITHM: &str = "RS256";

/// Public half of an account key. Field order is the RFC 7638 canonical order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct RsaJwk {
    e: String,
    kty: &'static str,
    n: String,
}

/// How the signer identifies itself in the protected header
#[derive(Debug, Clone, Copy)]
pub(crate) enum KeyBinding<'a> {
    /// Embedded public key, for newAccount
    Jwk,
    /// Account URL, for everything else
    Kid(&'a str),
}

#[derive(Serialize)]
struct ProtectedHeader<'a> {
    alg: &'static str,
    nonce: &'a str,
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<&'a RsaJwk>,
}

/// Flattened JWS JSON serialization, the request body of every ACME POST
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Jws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

/// RS256 signer derived from a client's RSA key
#[derive(Clone)]
pub struct AccountKey {
    signing_key: SigningKey<Sha256>,
    jwk: RsaJwk,
    thumbprint: String,
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKey")
            .field("thumbprint", &self.thumbprint)
            .finish_non_exhaustive()
    }
}

impl AccountKey {
    pub fn new(key: &RsaPrivateKey) -> AcmeResult<Self> {
        let jwk = RsaJwk {
            e: URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
            kty: "RSA",
            n: URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
        };
        let canonical =
            serde_json::to_vec(&jwk).map_err(|e| AcmeError::Protocol(e.to_string()))?;
        let thumbprint = URL_SAFE_NO_PAD.encode(Sha256::digest(canonical));

        Ok(Self {
            signing_key: SigningKey::<Sha256>::new(key.clone()),
            jwk,
            thumbprint,
        })
    }

    /// RFC 7638 JWK thumbprint, base64url without padding
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// Sign `payload` for `url`. `None` produces the empty payload of a POST-as-GET.
    pub(crate) fn sign(
        &self,
        payload: Option<&serde_json::Value>,
        nonce: &str,
        url: &str,
        binding: KeyBinding<'_>,
    ) -> AcmeResult<Jws> {
        let header = match binding {
            KeyBinding::Jwk => ProtectedHeader {
                alg: ALGORITHM,
                nonce,
                url,
                kid: None,
                jwk: Some(&self.jwk),
            },
            KeyBinding::Kid(kid) => ProtectedHeader {
                alg: ALGORITHM,
                nonce,
                url,
                kid: Some(kid),
                jwk: None,
            },
        };

        let header = serde_json::to_vec(&header).map_err(|e| AcmeError::Protocol(e.to_string()))?;
        let payload = match payload {
            Some(value) => {
                serde_json::to_vec(value).map_err(|e| AcmeError::Protocol(e.to_string()))?
            }
            None => Vec::new(),
        };

        let protected = URL_SAFE_NO_PAD.encode(header);
        let payload = URL_SAFE_NO_PAD.encode(payload);
        let signing_input = format!("{}.{}", protected, payload);
        let signature = self
            .signing_key
            .try_sign(signing_input.as_bytes())
            .map_err(|e| AcmeError::Protocol(format!("JWS signing failed: {}", e)))?;

        Ok(Jws {
            protected,
            payload,
            signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        })
    }
}
