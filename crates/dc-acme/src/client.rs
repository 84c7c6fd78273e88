use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::{Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::jws::{AccountKey, KeyBinding};
use crate::types::{AcmeError, AcmeResult, Challenge, Identifier, Problem};

const REPLAY_NONCE: &str = "replay-nonce";
const JOSE_JSON: &str = "application/jose+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Order {
    pub status: String,
    #[serde(default)]
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub error: Option<Problem>,
}

/// Authorization object as served by the CA, before it is tied to its order
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AuthorizationResource {
    pub identifier: Identifier,
    pub status: String,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub expires: Option<String>,
}

/// Thin RFC 8555 transport: directory, nonces and signed requests
pub(crate) struct AcmeClient {
    http: reqwest::Client,
    directory_url: String,
    directory: OnceCell<Directory>,
    nonce: Mutex<Option<String>>,
}

impl AcmeClient {
    pub fn new(directory_url: impl Into<String>) -> AcmeResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("dnscert/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            directory_url: directory_url.into(),
            directory: OnceCell::new(),
            nonce: Mutex::new(None),
        })
    }

    async fn directory(&self) -> AcmeResult<&Directory> {
        self.directory
            .get_or_try_init(|| async {
                debug!(url = %self.directory_url, "Fetching ACME directory");
                let response = self.http.get(&self.directory_url).send().await?;
                let response = check_status(response, &self.directory_url).await?;
                Ok::<_, AcmeError>(response.json::<Directory>().await?)
            })
            .await
    }

    fn remember_nonce(&self, response: &Response) {
        if let Some(nonce) = response
            .headers()
            .get(REPLAY_NONCE)
            .and_then(|v| v.to_str().ok())
        {
            *self.nonce.lock().unwrap_or_else(PoisonError::into_inner) = Some(nonce.to_string());
        }
    }

    async fn take_nonce(&self) -> AcmeResult<String> {
        let cached = self
            .nonce
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(nonce) = cached {
            return Ok(nonce);
        }

        let url = &self.directory().await?.new_nonce;
        let response = self.http.head(url).send().await?;
        response
            .headers()
            .get(REPLAY_NONCE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AcmeError::Protocol("CA returned no Replay-Nonce".into()))
    }

    /// Signed POST. A `badNonce` rejection is retried once with the nonce it carried.
    async fn post(
        &self,
        key: &AccountKey,
        binding: KeyBinding<'_>,
        url: &str,
        payload: Option<&Value>,
        accept: Option<&str>,
    ) -> AcmeResult<Response> {
        let mut retried = false;
        loop {
            let nonce = self.take_nonce().await?;
            let jws = key.sign(payload, &nonce, url, binding)?;
            let body = serde_json::to_vec(&jws).map_err(|e| AcmeError::Protocol(e.to_string()))?;

            let mut request = self.http.post(url).header(CONTENT_TYPE, JOSE_JSON).body(body);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            let response = request.send().await?;
            self.remember_nonce(&response);

            if response.status().is_success() {
                return Ok(response);
            }

            let status = response.status();
            let problem = read_problem(response, status).await;
            if problem.is_bad_nonce() && !retried {
                debug!(url = %url, "CA rejected nonce, retrying");
                retried = true;
                continue;
            }
            return Err(AcmeError::Protocol(format!(
                "{} returned {}: {}",
                url, status, problem
            )));
        }
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        key: &AccountKey,
        kid: &str,
        url: &str,
        payload: Option<&Value>,
    ) -> AcmeResult<T> {
        let response = self
            .post(key, KeyBinding::Kid(kid), url, payload, None)
            .await?;
        Ok(response.json::<T>().await?)
    }

    /// Create (or, with `only_existing`, look up) the account for `key`; returns its URL
    pub async fn new_account(
        &self,
        key: &AccountKey,
        contact: Option<&str>,
        only_existing: bool,
    ) -> AcmeResult<String> {
        let url = self.directory().await?.new_account.clone();
        let payload = if only_existing {
            json!({ "onlyReturnExisting": true })
        } else {
            match contact {
                Some(email) => json!({
                    "termsOfServiceAgreed": true,
                    "contact": [format!("mailto:{}", email)],
                }),
                None => json!({ "termsOfServiceAgreed": true }),
            }
        };

        let response = self
            .post(key, KeyBinding::Jwk, &url, Some(&payload), None)
            .await?;
        location(&response)
    }

    /// Place a single-identifier order; returns the order URL and body
    pub async fn new_order(
        &self,
        key: &AccountKey,
        kid: &str,
        domain: &str,
    ) -> AcmeResult<(String, Order)> {
        let url = self.directory().await?.new_order.clone();
        let payload = json!({
            "identifiers": [{ "type": "dns", "value": domain }],
        });

        let response = self
            .post(key, KeyBinding::Kid(kid), &url, Some(&payload), None)
            .await?;
        let order_url = location(&response)?;
        let order = response.json::<Order>().await?;
        Ok((order_url, order))
    }

    pub async fn fetch_authorization(
        &self,
        key: &AccountKey,
        kid: &str,
        url: &str,
    ) -> AcmeResult<AuthorizationResource> {
        self.post_json(key, kid, url, None).await
    }

    pub async fn fetch_order(&self, key: &AccountKey, kid: &str, url: &str) -> AcmeResult<Order> {
        self.post_json(key, kid, url, None).await
    }

    /// Tell the CA the challenge is ready to be validated
    pub async fn respond_challenge(
        &self,
        key: &AccountKey,
        kid: &str,
        url: &str,
    ) -> AcmeResult<Challenge> {
        self.post_json(key, kid, url, Some(&json!({}))).await
    }

    pub async fn finalize_order(
        &self,
        key: &AccountKey,
        kid: &str,
        url: &str,
        csr_der: &[u8],
    ) -> AcmeResult<Order> {
        let csr = URL_SAFE_NO_PAD.encode(csr_der);
        self.post_json(key, kid, url, Some(&json!({ "csr": csr }))).await
    }

    /// Download the issued chain, leaf first
    pub async fn download_certificate(
        &self,
        key: &AccountKey,
        kid: &str,
        url: &str,
    ) -> AcmeResult<Vec<Vec<u8>>> {
        let response = self
            .post(key, KeyBinding::Kid(kid), url, None, Some(PEM_CHAIN))
            .await?;
        let chain = response.text().await?;
        Ok(dc_keys::decode_certificate_chain(&chain)?)
    }
}

fn location(response: &Response) -> AcmeResult<String> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| AcmeError::Protocol("CA response has no Location header".into()))
}

async fn read_problem(response: Response, status: StatusCode) -> Problem {
    response.json::<Problem>().await.unwrap_or_else(|_| Problem {
        kind: status.to_string(),
        detail: None,
    })
}

async fn check_status(response: Response, url: &str) -> AcmeResult<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let problem = read_problem(response, status).await;
    Err(AcmeError::Protocol(format!(
        "{} returned {}: {}",
        url, status, problem
    )))
}
