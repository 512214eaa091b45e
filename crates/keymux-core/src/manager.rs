//! Reversible mutation log over the in-flight request.
//!
//! Mutators only ever receive the manager, never the raw request, so every
//! per-attempt change is recorded with its prior value and `revert` restores
//! the exact pre-mutation state for the next attempt. The assigned key is
//! the one mutation that survives a revert: it is opaque to the client and
//! the next attempt assigns a fresh one anyway.

use keymux_keys::Key;
use serde_json::Value as JsonValue;

use crate::request::{ProxyRequest, SignedRequest};

#[derive(Debug)]
enum Mutation {
    SetHeader { name: String, prior: Option<String> },
    RemoveHeader { name: String, prior: Option<String> },
    ReplaceBody { prior: JsonValue },
    SetPath { prior: String },
    SetSigned { prior: Option<SignedRequest> },
    SetKey,
}

#[derive(Debug)]
pub struct RequestManager {
    request: ProxyRequest,
    log: Vec<Mutation>,
}

impl RequestManager {
    pub fn new(request: ProxyRequest) -> Self {
        Self {
            request,
            log: Vec::new(),
        }
    }

    pub fn request(&self) -> &ProxyRequest {
        &self.request
    }

    /// Mutable access for lifecycle fields the log does not track
    /// (timestamps, retry counter, token counts).
    pub fn request_mut(&mut self) -> &mut ProxyRequest {
        &mut self.request
    }

    pub fn into_request(self) -> ProxyRequest {
        self.request
    }

    pub fn log_is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let prior = take_header(&mut self.request.headers, &name);
        self.request.headers.push((name.clone(), value));
        self.log.push(Mutation::SetHeader { name, prior });
    }

    pub fn remove_header(&mut self, name: &str) {
        let prior = take_header(&mut self.request.headers, name);
        // Recording a removal of an absent header keeps revert symmetric.
        self.log.push(Mutation::RemoveHeader {
            name: name.to_string(),
            prior,
        });
    }

    pub fn replace_body(&mut self, body: JsonValue) {
        let prior = std::mem::replace(&mut self.request.body, body);
        self.log.push(Mutation::ReplaceBody { prior });
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        let prior = std::mem::replace(&mut self.request.path, path.into());
        self.log.push(Mutation::SetPath { prior });
    }

    pub fn set_key(&mut self, key: Key) {
        self.request.key = Some(key);
        self.log.push(Mutation::SetKey);
    }

    pub fn set_signed_request(&mut self, signed: SignedRequest) {
        let prior = self.request.signed.replace(signed);
        self.log.push(Mutation::SetSigned { prior });
    }

    /// Pops the log in reverse, reapplying each inverse. After this the
    /// observable request state (headers, body, path, signed envelope)
    /// equals the state before the first mutation.
    pub fn revert(&mut self) {
        while let Some(mutation) = self.log.pop() {
            match mutation {
                Mutation::SetHeader { name, prior } | Mutation::RemoveHeader { name, prior } => {
                    take_header(&mut self.request.headers, &name);
                    if let Some(value) = prior {
                        self.request.headers.push((name, value));
                    }
                }
                Mutation::ReplaceBody { prior } => {
                    self.request.body = prior;
                }
                Mutation::SetPath { prior } => {
                    self.request.path = prior;
                }
                Mutation::SetSigned { prior } => {
                    self.request.signed = prior;
                }
                Mutation::SetKey => {}
            }
        }
    }
}

fn take_header(headers: &mut Vec<(String, String)>, name: &str) -> Option<String> {
    let lowered = name.to_ascii_lowercase();
    let idx = headers
        .iter()
        .position(|(k, _)| k.to_ascii_lowercase() == lowered)?;
    Some(headers.remove(idx).1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use keymux_keys::{ModelFamily, Service};
    use keymux_protocol::ApiFormat;

    fn request() -> ProxyRequest {
        ProxyRequest {
            id: "req-1".to_string(),
            identity: "user-1".to_string(),
            inbound_format: ApiFormat::OpenAiChat,
            outbound_format: ApiFormat::OpenAiChat,
            service: Service::OpenAi,
            model: "gpt-4o-2024-05-13".to_string(),
            model_family: ModelFamily::Gpt4o,
            body: serde_json::json!({"model": "gpt-4o-2024-05-13"}),
            headers: vec![
                ("origin".to_string(), "https://example.com".to_string()),
                ("content-type".to_string(), "application/json".to_string()),
            ],
            path: "/v1/chat/completions".to_string(),
            key: None,
            signed: None,
            streaming: false,
            start_time: 0,
            queue_out_time: 0,
            retry_count: 0,
            prompt_tokens: 0,
            output_tokens: 0,
        }
    }

    #[test]
    fn revert_restores_pre_mutation_state() {
        let original = request();
        let mut manager = RequestManager::new(original.clone());

        manager.remove_header("origin");
        manager.set_header("authorization", "Bearer sk-live");
        manager.set_header("content-type", "application/json; charset=utf-8");
        manager.replace_body(serde_json::json!({"model": "rewritten"}));
        manager.set_path("/upstream/path");
        manager.set_signed_request(SignedRequest {
            method: "POST".to_string(),
            hostname: "bedrock-runtime.us-east-1.amazonaws.com".to_string(),
            path: "/model/x/invoke".to_string(),
            headers: Vec::new(),
            body: Bytes::from_static(b"{}"),
        });
        assert_eq!(manager.log_len(), 6);

        manager.revert();
        assert!(manager.log_is_empty());

        let reverted = manager.request();
        let mut got: Vec<_> = reverted.headers.clone();
        let mut want: Vec<_> = original.headers.clone();
        got.sort();
        want.sort();
        assert_eq!(got, want);
        assert_eq!(reverted.body, original.body);
        assert_eq!(reverted.path, original.path);
        assert_eq!(reverted.signed, original.signed);
    }

    #[test]
    fn key_assignment_survives_revert() {
        let mut manager = RequestManager::new(request());
        let key = keymux_keys::Key::new(
            Service::OpenAi,
            "sk-test",
            [ModelFamily::Gpt4o],
            keymux_keys::KeyDetail::GoogleAi,
        );
        manager.set_key(key.clone());
        manager.revert();
        assert_eq!(
            manager.request().key.as_ref().map(|k| k.hash.clone()),
            Some(key.hash)
        );
    }

    #[test]
    fn double_mutation_of_same_header_reverts_to_original() {
        let mut manager = RequestManager::new(request());
        manager.set_header("content-type", "text/plain");
        manager.set_header("content-type", "application/octet-stream");
        manager.revert();
        assert_eq!(
            manager.request().header("content-type"),
            Some("application/json")
        );
    }
}
