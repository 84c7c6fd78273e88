use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

use crate::jws::AccountKey;
use crate::types::{AcmeError, AcmeResult, Authorization, CHALLENGE_TYPE_DNS01, Challenge};

/// Pick the dns-01 challenge out of an authorization
pub fn select_challenge(authz: &Authorization) -> AcmeResult<&Challenge> {
    authz
        .challenges
        .iter()
        .find(|c| c.kind == CHALLENGE_TYPE_DNS01)
        .ok_or_else(|| AcmeError::NoSupportedChallenge(authz.domain().to_string()))
}

/// TXT record value proving control of the domain for `challenge`:
/// base64url(SHA-256(token "." thumbprint)), unpadded.
pub fn compute_challenge_value(key: &AccountKey, challenge: &Challenge) -> String {
    let key_authorization = format!("{}.{}", challenge.token, key.thumbprint());
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}
