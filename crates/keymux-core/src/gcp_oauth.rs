//! GCP service-account OAuth token exchange (RS256 JWT bearer grant).
//!
//! Tokens are cached per service account. Refresh is guarded by a per-account
//! lock with double-checked expiry so concurrent mutators observing an
//! expired token trigger exactly one upstream exchange.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use keymux_keys::now_ms;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::ProxyError;
use crate::upstream::{UpstreamBody, UpstreamClient, UpstreamRequest};

const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
/// Tokens within this slack of expiry count as expired.
const EXPIRY_SLACK_MS: u64 = 60_000;

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Default)]
pub struct GcpTokenBroker {
    tokens: Mutex<HashMap<String, (String, u64)>>,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GcpTokenBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn access_token(
        &self,
        client: &dyn UpstreamClient,
        client_email: &str,
        private_key_b64: &str,
    ) -> Result<String, ProxyError> {
        if let Some(token) = self.cached(client_email).await {
            return Ok(token);
        }

        let lock = self.refresh_lock(client_email).await;
        let _guard = lock.lock().await;
        // Double-check: another mutator may have refreshed while we waited.
        if let Some(token) = self.cached(client_email).await {
            return Ok(token);
        }

        let (token, expires_at) = self
            .exchange(client, client_email, private_key_b64)
            .await?;
        self.tokens
            .lock()
            .await
            .insert(client_email.to_string(), (token.clone(), expires_at));
        Ok(token)
    }

    /// Expiry timestamp of the cached token, for provider bookkeeping.
    pub async fn cached_expiry(&self, client_email: &str) -> Option<u64> {
        self.tokens
            .lock()
            .await
            .get(client_email)
            .map(|(_, expires_at)| *expires_at)
    }

    async fn cached(&self, client_email: &str) -> Option<String> {
        let tokens = self.tokens.lock().await;
        let (token, expires_at) = tokens.get(client_email)?;
        (now_ms() + EXPIRY_SLACK_MS < *expires_at).then(|| token.clone())
    }

    async fn refresh_lock(&self, client_email: &str) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks
            .entry(client_email.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn exchange(
        &self,
        client: &dyn UpstreamClient,
        client_email: &str,
        private_key_b64: &str,
    ) -> Result<(String, u64), ProxyError> {
        let now_secs = (now_ms() / 1000) as i64;
        let claims = JwtClaims {
            iss: client_email,
            scope: SCOPE,
            aud: TOKEN_URI,
            exp: now_secs + 3600,
            iat: now_secs,
        };
        let der = base64::engine::general_purpose::STANDARD
            .decode(private_key_b64)
            .map_err(|err| {
                ProxyError::upstream_fatal(format!("gcp private key decode: {err}"))
            })?;
        let key = EncodingKey::from_rsa_der(&der);
        let jwt = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|err| ProxyError::upstream_fatal(format!("gcp jwt encode: {err}")))?;

        let form = format!(
            "grant_type=urn:ietf:params:oauth:grant-type:jwt-bearer&assertion={}",
            urlencoding::encode(&jwt)
        );
        let response = client
            .send(UpstreamRequest {
                method: "POST".to_string(),
                url: TOKEN_URI.to_string(),
                headers: vec![(
                    "content-type".to_string(),
                    "application/x-www-form-urlencoded".to_string(),
                )],
                body: Some(Bytes::from(form)),
                want_stream: false,
            })
            .await?;

        let body = match response.body {
            UpstreamBody::Buffered(bytes) => bytes,
            UpstreamBody::Stream(_) => Bytes::new(),
        };
        if !(200..300).contains(&response.status) {
            return Err(ProxyError::upstream_fatal(format!(
                "gcp token exchange failed: {} {}",
                response.status,
                String::from_utf8_lossy(&body)
            )));
        }
        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|err| ProxyError::upstream_fatal(format!("gcp token parse: {err}")))?;
        let expires_at = now_ms() + (parsed.expires_in.unwrap_or(3600).max(0) as u64) * 1000;
        Ok((parsed.access_token, expires_at))
    }
}
