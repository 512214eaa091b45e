//! One-time, pre-enqueue request transforms.
//!
//! These run exactly once per request lifetime, in a fixed order; any
//! failure surfaces to the client before the request ever enters the queue.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use keymux_common::ProxyConfig;
use keymux_keys::{now_ms, ModelFamily, Service};
use keymux_protocol::openai::ChatMessage;
use keymux_protocol::ApiFormat;
use keymux_transform::request::transform_request;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ProxyError;
use crate::request::ProxyRequest;
use crate::tokens::count_chat_prompt;

const DEFAULT_OUTPUT_TOKENS: u64 = 1024;
/// Content-filter backoff doubles per hit, capped here.
const FILTER_BACKOFF_BASE_MS: u64 = 5_000;
const FILTER_BACKOFF_CAP_MS: u64 = 10 * 60 * 1000;

/// Optional moderation hook; a hit rejects the request.
#[async_trait]
pub trait ContentFilter: Send + Sync {
    async fn flags(&self, text: &str) -> bool;
}

/// Per-user per-family token budgets, consumed optimistically at enqueue.
#[derive(Default)]
pub struct UserQuotas {
    used: Mutex<HashMap<(String, ModelFamily), u64>>,
}

impl UserQuotas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when consuming `tokens` would cross the family limit.
    pub async fn try_consume(
        &self,
        limits: &HashMap<String, u64>,
        identity: &str,
        family: ModelFamily,
        tokens: u64,
    ) -> bool {
        let Some(limit) = limits.get(family.as_str()) else {
            return true;
        };
        let mut used = self.used.lock().await;
        let entry = used
            .entry((identity.to_string(), family))
            .or_insert(0);
        if *entry + tokens > *limit {
            return false;
        }
        *entry += tokens;
        true
    }

    pub async fn used(&self, identity: &str, family: ModelFamily) -> u64 {
        self.used
            .lock()
            .await
            .get(&(identity.to_string(), family))
            .copied()
            .unwrap_or(0)
    }
}

pub struct PreprocessCtx {
    pub quotas: Arc<UserQuotas>,
    pub filter: Option<Arc<dyn ContentFilter>>,
    /// ip → (hits, blocked_until_ms)
    filter_backoff: Mutex<HashMap<String, (u32, u64)>>,
}

impl PreprocessCtx {
    pub fn new(quotas: Arc<UserQuotas>, filter: Option<Arc<dyn ContentFilter>>) -> Self {
        Self {
            quotas,
            filter,
            filter_backoff: Mutex::new(HashMap::new()),
        }
    }
}

/// Runs the full preprocessor chain. The request's formats and service were
/// tagged by route classification before this point.
pub async fn run_preprocessors(
    request: &mut ProxyRequest,
    client_ip: &str,
    config: &ProxyConfig,
    ctx: &PreprocessCtx,
) -> Result<(), ProxyError> {
    block_disallowed_origins(request, config)?;
    transform_api_format(request)?;
    count_prompt_tokens(request)?;
    apply_content_filter(request, client_ip, ctx).await?;
    validate_limits(request, config)?;
    check_quota(request, config, ctx).await?;
    debug!(
        event = "request_preprocessed",
        request_id = %request.id,
        family = %request.model_family,
        prompt_tokens = request.prompt_tokens,
        output_tokens = request.output_tokens
    );
    Ok(())
}

fn block_disallowed_origins(
    request: &ProxyRequest,
    config: &ProxyConfig,
) -> Result<(), ProxyError> {
    for header in ["origin", "referer"] {
        if let Some(value) = request.header(header) {
            if config
                .blocked_origins
                .iter()
                .any(|blocked| !blocked.is_empty() && value.contains(blocked))
            {
                return Err(ProxyError::forbidden("requests from this origin are not allowed"));
            }
        }
    }
    Ok(())
}

fn transform_api_format(request: &mut ProxyRequest) -> Result<(), ProxyError> {
    if request.inbound_format == request.outbound_format {
        return Ok(());
    }
    let translated = transform_request(
        request.inbound_format,
        request.outbound_format,
        &request.body,
    )
    .map_err(|err| ProxyError::bad_request(err.to_string()))?;
    request.body = translated;
    Ok(())
}

fn count_prompt_tokens(request: &mut ProxyRequest) -> Result<(), ProxyError> {
    // Token counting runs on the client's view of the prompt; the translated
    // body may rename fields but carries the same text.
    let (prompt_tokens, requested_output) = match request.inbound_format {
        ApiFormat::OpenAiChat => {
            let messages: Vec<ChatMessage> = request
                .body
                .get("messages")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|err| ProxyError::bad_request(format!("invalid messages: {err}")))?
                .unwrap_or_default();
            let counted = if messages.is_empty() {
                fallback_prompt_tokens(request)?
            } else {
                count_chat_prompt(&request.model, &messages)?
            };
            (counted, requested_max_tokens(request))
        }
        _ => (fallback_prompt_tokens(request)?, requested_max_tokens(request)),
    };
    request.prompt_tokens = prompt_tokens;
    request.output_tokens = requested_output.unwrap_or(DEFAULT_OUTPUT_TOKENS);
    Ok(())
}

fn fallback_prompt_tokens(request: &ProxyRequest) -> Result<u64, ProxyError> {
    let text = collect_text(&request.body);
    crate::tokens::count_text(&request.model, &text)
}

fn requested_max_tokens(request: &ProxyRequest) -> Option<u64> {
    for field in [
        "max_completion_tokens",
        "max_tokens",
        "max_tokens_to_sample",
    ] {
        if let Some(value) = request.body.get(field).and_then(|v| v.as_u64()) {
            return Some(value);
        }
    }
    request
        .body
        .pointer("/generationConfig/maxOutputTokens")
        .and_then(|v| v.as_u64())
}

async fn apply_content_filter(
    request: &ProxyRequest,
    client_ip: &str,
    ctx: &PreprocessCtx,
) -> Result<(), ProxyError> {
    let Some(filter) = &ctx.filter else {
        return Ok(());
    };
    let now = now_ms();
    {
        let backoff = ctx.filter_backoff.lock().await;
        if let Some((_, blocked_until)) = backoff.get(client_ip) {
            if *blocked_until > now {
                return Err(ProxyError::forbidden(
                    "temporarily blocked after repeated policy rejections",
                ));
            }
        }
    }
    if filter.flags(&collect_text(&request.body)).await {
        let mut backoff = ctx.filter_backoff.lock().await;
        let (hits, _) = backoff.get(client_ip).copied().unwrap_or((0, 0));
        let hits = hits + 1;
        let delay =
            (FILTER_BACKOFF_BASE_MS << (hits - 1).min(16)).min(FILTER_BACKOFF_CAP_MS);
        backoff.insert(client_ip.to_string(), (hits, now + delay));
        return Err(ProxyError::forbidden("request rejected by content policy"));
    }
    Ok(())
}

fn validate_limits(request: &ProxyRequest, config: &ProxyConfig) -> Result<(), ProxyError> {
    if request.prompt_tokens + request.output_tokens > config.max_context_tokens {
        return Err(ProxyError::bad_request(format!(
            "request of {} tokens exceeds the {}-token context limit",
            request.prompt_tokens + request.output_tokens,
            config.max_context_tokens
        )));
    }
    if !config.allow_vision && body_has_image(&request.body) {
        return Err(ProxyError::forbidden("image inputs are not enabled"));
    }
    let service_tag = match request.model_family.service() {
        Service::OpenAi => "openai",
        Service::Anthropic => "anthropic",
        Service::Aws => "aws",
        Service::Gcp => "gcp",
        Service::Azure => "azure",
        Service::GoogleAi => "google-ai",
        Service::Mistral => "mistral",
    };
    if !config.credentials.contains_key(service_tag) {
        return Err(ProxyError::forbidden(format!(
            "model family {} is not enabled on this proxy",
            request.model_family
        )));
    }
    Ok(())
}

async fn check_quota(
    request: &ProxyRequest,
    config: &ProxyConfig,
    ctx: &PreprocessCtx,
) -> Result<(), ProxyError> {
    let allowed = ctx
        .quotas
        .try_consume(
            &config.token_quotas,
            &request.identity,
            request.model_family,
            request.prompt_tokens + request.output_tokens,
        )
        .await;
    if !allowed {
        return Err(ProxyError::forbidden(format!(
            "token quota exceeded for family {}",
            request.model_family
        )));
    }
    Ok(())
}

fn body_has_image(body: &serde_json::Value) -> bool {
    match body {
        serde_json::Value::Object(map) => map.iter().any(|(key, value)| {
            key == "image_url" || key == "image" || key == "inlineData" || body_has_image_in(value)
        }),
        serde_json::Value::Array(items) => items.iter().any(body_has_image),
        _ => false,
    }
}

fn body_has_image_in(value: &serde_json::Value) -> bool {
    body_has_image(value)
}

/// All string leaves joined; feeds the tokenizer fallback and the filter.
fn collect_text(body: &serde_json::Value) -> String {
    let mut out = String::new();
    collect_text_into(body, &mut out);
    out
}

fn collect_text_into(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::String(text) => {
            out.push_str(text);
            out.push('\n');
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_text_into(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for (key, item) in map {
                // Skip base64 payloads; they are not prompt text.
                if key == "data" || key == "url" {
                    continue;
                }
                collect_text_into(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn test_request(body: serde_json::Value) -> ProxyRequest {
        ProxyRequest {
            id: "req".to_string(),
            identity: "user".to_string(),
            inbound_format: ApiFormat::OpenAiChat,
            outbound_format: ApiFormat::OpenAiChat,
            service: Service::OpenAi,
            model: "gpt-4o-2024-05-13".to_string(),
            model_family: ModelFamily::Gpt4o,
            body,
            headers: Vec::new(),
            path: String::new(),
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

    fn ctx() -> PreprocessCtx {
        PreprocessCtx::new(Arc::new(UserQuotas::new()), None)
    }

    #[tokio::test]
    async fn blocked_origin_is_rejected() {
        let config = ProxyConfig {
            blocked_origins: vec!["evil.example".to_string()],
            credentials: HashMap::from([("openai".to_string(), "sk-a".to_string())]),
            ..Default::default()
        };
        let ctx = ctx();
        let mut request = test_request(serde_json::json!({
            "model": "gpt-4o-2024-05-13",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        request
            .headers
            .push(("origin".to_string(), "https://evil.example/app".to_string()));
        let err = run_preprocessors(&mut request, "1.2.3.4", &config, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn tokens_are_counted_and_quota_enforced() {
        let config = ProxyConfig {
            credentials: HashMap::from([("openai".to_string(), "sk-a".to_string())]),
            token_quotas: HashMap::from([("gpt4o".to_string(), 1_100u64)]),
            ..Default::default()
        };
        let ctx = ctx();
        let mut request = test_request(serde_json::json!({
            "model": "gpt-4o-2024-05-13",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 1000
        }));
        run_preprocessors(&mut request, "ip", &config, &ctx)
            .await
            .unwrap();
        assert!(request.prompt_tokens > 0);
        assert_eq!(request.output_tokens, 1000);

        // Second request crosses the 1100-token family quota.
        let mut second = test_request(serde_json::json!({
            "model": "gpt-4o-2024-05-13",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 1000
        }));
        let err = run_preprocessors(&mut second, "ip", &config, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn oversized_context_is_rejected() {
        let config = ProxyConfig {
            credentials: HashMap::from([("openai".to_string(), "sk-a".to_string())]),
            max_context_tokens: 100,
            ..Default::default()
        };
        let ctx = ctx();
        let mut request = test_request(serde_json::json!({
            "model": "gpt-4o-2024-05-13",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 5000
        }));
        let err = run_preprocessors(&mut request, "ip", &config, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn format_transform_rewrites_body_once() {
        let config = ProxyConfig {
            credentials: HashMap::from([("anthropic".to_string(), "sk-ant".to_string())]),
            ..Default::default()
        };
        let ctx = ctx();
        let mut request = test_request(serde_json::json!({
            "model": "claude-3-5-sonnet-20240620",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 64
        }));
        request.model = "claude-3-5-sonnet-20240620".to_string();
        request.model_family = ModelFamily::Claude;
        request.service = Service::Anthropic;
        request.outbound_format = ApiFormat::AnthropicChat;
        run_preprocessors(&mut request, "ip", &config, &ctx)
            .await
            .unwrap();
        assert!(request.body.get("messages").is_some());
        assert!(request.body.get("max_tokens").is_some());
        // Anthropic shape: no OpenAI-style role strings in system position.
        assert!(request.body.get("model").is_some());
    }
}
