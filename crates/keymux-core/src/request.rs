//! The in-flight request record.

use bytes::Bytes;
use keymux_keys::{Key, ModelFamily, Service};
use keymux_protocol::ApiFormat;
use serde_json::Value as JsonValue;

/// Pre-computed HTTP envelope for providers that sign whole requests
/// (AWS SigV4) or need a bearer resolved ahead of dispatch (GCP OAuth).
#[derive(Debug, Clone, PartialEq)]
pub struct SignedRequest {
    pub method: String,
    pub hostname: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub id: String,
    /// Queue identity: user token if present, alternate header otherwise,
    /// else the client IP.
    pub identity: String,
    pub inbound_format: ApiFormat,
    pub outbound_format: ApiFormat,
    pub service: Service,
    pub model: String,
    pub model_family: ModelFamily,
    /// Current (possibly translated) payload.
    pub body: JsonValue,
    /// Headers bound for upstream; starts as a copy of the client's.
    pub headers: Vec<(String, String)>,
    /// Upstream path, set by the auth mutator.
    pub path: String,
    pub key: Option<Key>,
    pub signed: Option<SignedRequest>,
    pub streaming: bool,
    pub start_time: u64,
    pub queue_out_time: u64,
    pub retry_count: u32,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
}

impl ProxyRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == name)
            .map(|(_, v)| v.as_str())
    }
}
