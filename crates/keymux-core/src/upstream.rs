//! Upstream HTTP transport.
//!
//! Everything that leaves the process goes through `UpstreamClient`, so the
//! pipeline, checkers and token broker can all be exercised against a stub.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use wreq::{Client, Method, Proxy};

use keymux_keys::{ProbeAuth, ProbeClient, ProbeRequest, ProbeResponse};

use crate::error::{redact_hostnames, ProxyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    /// Client-safe rendering; hostnames from resolver errors are redacted.
    pub fn redacted(&self) -> String {
        redact_hostnames(&self.message)
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub want_stream: bool,
}

pub enum UpstreamBody {
    Buffered(Bytes),
    Stream(tokio::sync::mpsc::Receiver<Bytes>),
}

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == name)
            .map(|(_, v)| v.as_str())
    }
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10 * 60),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Production transport over `wreq`, one cached client per proxy setting.
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, TransportError> {
        let proxy = config.proxy.clone().filter(|p| !p.trim().is_empty());
        let client = build_client(&config, proxy.as_deref()).map_err(map_error)?;
        let mut clients = HashMap::new();
        clients.insert(proxy, client);
        Ok(Self {
            config,
            clients: Mutex::new(clients),
        })
    }

    fn client(&self) -> Result<Client, TransportError> {
        let proxy = self.config.proxy.clone().filter(|p| !p.trim().is_empty());
        let mut guard = self.clients.lock().map_err(|_| TransportError {
            kind: TransportErrorKind::Other,
            message: "client cache lock poisoned".to_string(),
        })?;
        if let Some(client) = guard.get(&proxy) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, proxy.as_deref()).map_err(map_error)?;
        guard.insert(proxy, client.clone());
        Ok(client)
    }
}

fn build_client(
    config: &UpstreamClientConfig,
    proxy: Option<&str>,
) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .read_timeout(config.stream_idle_timeout);
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    builder.build()
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let client = self.client()?;
            let method = Method::from_bytes(req.method.as_bytes()).map_err(|err| {
                TransportError {
                    kind: TransportErrorKind::Other,
                    message: err.to_string(),
                }
            })?;
            let mut builder = client.request(method, &req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = req.body {
                builder = builder.body(body);
            }
            let response = builder.send().await.map_err(map_error)?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();

            if !req.want_stream || !(200..300).contains(&status) {
                let body = response.bytes().await.map_err(map_error)?;
                return Ok(UpstreamResponse {
                    status,
                    headers,
                    body: UpstreamBody::Buffered(body),
                });
            }

            let idle = self.config.stream_idle_timeout;
            let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
            tokio::spawn(async move {
                let mut stream = response.bytes_stream();
                loop {
                    let next = tokio::time::timeout(idle, stream.next()).await;
                    let Ok(Some(Ok(chunk))) = next else {
                        break;
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            });
            Ok(UpstreamResponse {
                status,
                headers,
                body: UpstreamBody::Stream(rx),
            })
        })
    }
}

fn map_error(err: wreq::Error) -> TransportError {
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    let kind = if err.is_timeout() {
        if lowered.contains("read") || lowered.contains("idle") {
            TransportErrorKind::ReadTimeout
        } else {
            TransportErrorKind::Timeout
        }
    } else if err.is_connect() {
        if lowered.contains("dns") || lowered.contains("resolve") {
            TransportErrorKind::Dns
        } else if lowered.contains("tls") || lowered.contains("ssl") {
            TransportErrorKind::Tls
        } else {
            TransportErrorKind::Connect
        }
    } else if lowered.contains("tls") || lowered.contains("ssl") {
        TransportErrorKind::Tls
    } else {
        TransportErrorKind::Other
    };
    TransportError { kind, message }
}

impl From<TransportError> for ProxyError {
    fn from(err: TransportError) -> Self {
        ProxyError::retryable(err.redacted())
    }
}

/// Probe transport for the key checkers: resolves checker-declared auth
/// (SigV4, GCP OAuth) before handing the request to the upstream client.
pub struct SigningProbeClient {
    client: Arc<dyn UpstreamClient>,
    gcp_tokens: Arc<crate::gcp_oauth::GcpTokenBroker>,
}

impl SigningProbeClient {
    pub fn new(
        client: Arc<dyn UpstreamClient>,
        gcp_tokens: Arc<crate::gcp_oauth::GcpTokenBroker>,
    ) -> Self {
        Self { client, gcp_tokens }
    }
}

#[async_trait]
impl ProbeClient for SigningProbeClient {
    async fn send(&self, req: ProbeRequest) -> Result<ProbeResponse, String> {
        let mut headers = req.headers.clone();
        match &req.auth {
            ProbeAuth::None => {}
            ProbeAuth::AwsSigV4 {
                access_key_id,
                secret_access_key,
                region,
                service,
            } => {
                let (host, path) = split_url(&req.url).ok_or("bad probe url")?;
                let signer = crate::sigv4::SigV4Signer::new(
                    access_key_id.clone(),
                    secret_access_key.clone(),
                    region.clone(),
                    service.to_string(),
                );
                let header_map: std::collections::BTreeMap<String, String> =
                    headers.iter().cloned().collect();
                let signed = signer
                    .sign(
                        req.method,
                        &host,
                        &path,
                        &header_map,
                        req.body.as_deref().unwrap_or(&[]),
                        crate::sigv4::SigV4Timestamp::now().map_err(|err| err.to_string())?,
                    )
                    .map_err(|err| err.to_string())?;
                headers.extend(signed.into_pairs());
            }
            ProbeAuth::GcpOauth {
                client_email,
                private_key_b64,
            } => {
                let token = self
                    .gcp_tokens
                    .access_token(self.client.as_ref(), client_email, private_key_b64)
                    .await
                    .map_err(|err| err.to_string())?;
                headers.push(("authorization".to_string(), format!("Bearer {token}")));
            }
        }

        let response = self
            .client
            .send(UpstreamRequest {
                method: req.method.to_string(),
                url: req.url.clone(),
                headers,
                body: req.body.clone().map(Bytes::from),
                want_stream: false,
            })
            .await
            .map_err(|err| err.redacted())?;
        let body = match response.body {
            UpstreamBody::Buffered(bytes) => bytes.to_vec(),
            UpstreamBody::Stream(_) => Vec::new(),
        };
        Ok(ProbeResponse {
            status: response.status,
            headers: response.headers,
            body,
        })
    }
}

/// `https://host/path?query` → (host, "/path?query").
pub fn split_url(url: &str) -> Option<(String, String)> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    match rest.split_once('/') {
        Some((host, path)) => Some((host.to_string(), format!("/{path}"))),
        None => Some((rest.to_string(), "/".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_splitting_keeps_query() {
        let (host, path) = split_url("https://api.openai.com/v1/models?limit=2").unwrap();
        assert_eq!(host, "api.openai.com");
        assert_eq!(path, "/v1/models?limit=2");
        assert_eq!(
            split_url("https://api.mistral.ai").unwrap().1,
            "/".to_string()
        );
    }
}
