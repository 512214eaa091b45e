use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use keymux_common::ProxyConfig;
use keymux_core::pipeline::{handle_blocking, handle_streaming};
use keymux_core::request::ProxyRequest;
use keymux_core::{
    ProxyState, TransportError, TransportErrorKind, UpstreamBody, UpstreamClient, UpstreamRequest,
    UpstreamResponse,
};
use keymux_keys::provider::KeyProvider;
use keymux_keys::{family_of, now_ms, ModelFamily, Service};
use keymux_protocol::ApiFormat;
use tokio::sync::mpsc;

const SONNET: &str = "claude-3-5-sonnet-20240620";

// ---- scripted upstream ----

enum Canned {
    Json {
        status: u16,
        headers: Vec<(String, String)>,
        body: serde_json::Value,
        delay: Duration,
    },
    Sse {
        frames: Vec<String>,
    },
    Transport,
}

struct ScriptedClient {
    script: Mutex<std::collections::VecDeque<Canned>>,
    seen: Mutex<Vec<UpstreamRequest>>,
}

impl ScriptedClient {
    fn new(script: Vec<Canned>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<UpstreamRequest> {
        self.seen.lock().unwrap().clone()
    }
}

impl UpstreamClient for ScriptedClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.seen.lock().unwrap().push(req);
            let canned = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted upstream ran out of responses");
            match canned {
                Canned::Json {
                    status,
                    headers,
                    body,
                    delay,
                } => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(UpstreamResponse {
                        status,
                        headers,
                        body: UpstreamBody::Buffered(Bytes::from(body.to_string())),
                    })
                }
                Canned::Sse { frames } => {
                    let (tx, rx) = mpsc::channel(16);
                    tokio::spawn(async move {
                        for frame in frames {
                            if tx.send(Bytes::from(frame)).await.is_err() {
                                return;
                            }
                        }
                    });
                    Ok(UpstreamResponse {
                        status: 200,
                        headers: vec![(
                            "content-type".to_string(),
                            "text/event-stream".to_string(),
                        )],
                        body: UpstreamBody::Stream(rx),
                    })
                }
                Canned::Transport => Err(TransportError {
                    kind: TransportErrorKind::Connect,
                    message: "connection refused".to_string(),
                }),
            }
        })
    }
}

fn json_200(body: serde_json::Value) -> Canned {
    Canned::Json {
        status: 200,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body,
        delay: Duration::ZERO,
    }
}

fn json_status(status: u16, body: serde_json::Value) -> Canned {
    Canned::Json {
        status,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body,
        delay: Duration::ZERO,
    }
}

fn request_for(model: &str, identity: &str, inbound: ApiFormat, streaming: bool) -> ProxyRequest {
    let family = family_of(model).unwrap();
    let outbound = match family.service() {
        Service::Anthropic => ApiFormat::AnthropicChat,
        _ => ApiFormat::OpenAiChat,
    };
    ProxyRequest {
        id: format!("test-{identity}-{}", now_ms()),
        identity: identity.to_string(),
        inbound_format: inbound,
        outbound_format: outbound,
        service: family.service(),
        model: model.to_string(),
        model_family: family,
        body: serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 64,
            "stream": streaming,
        }),
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        path: String::new(),
        key: None,
        signed: None,
        streaming,
        start_time: now_ms(),
        queue_out_time: 0,
        retry_count: 0,
        prompt_tokens: 0,
        output_tokens: 0,
    }
}

fn config_with(providers: &[(&str, &str)]) -> ProxyConfig {
    ProxyConfig {
        credentials: providers
            .iter()
            .map(|(tag, keys)| (tag.to_string(), keys.to_string()))
            .collect::<HashMap<_, _>>(),
        ..Default::default()
    }
}

fn openai_completion(text: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 1,
        "model": "gpt-3.5-turbo",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 5, "total_tokens": 14}
    })
}

fn anthropic_message(text: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "msg_01",
        "type": "message",
        "role": "assistant",
        "model": SONNET,
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 9, "output_tokens": 4}
    })
}

// ---- scenarios ----

#[tokio::test]
async fn single_key_happy_path_counts_usage_and_throttles() {
    let client = ScriptedClient::new(vec![json_200(openai_completion("hello there"))]);
    let state = ProxyState::for_tests(
        config_with(&[("openai", "sk-aaaa")]),
        client.clone(),
    )
    .await;

    let dispatch_time = now_ms();
    let response = handle_blocking(
        state.clone(),
        request_for("gpt-3.5-turbo", "token:u1", ApiFormat::OpenAiChat, false),
        "1.2.3.4".to_string(),
    )
    .await;

    assert_eq!(response.status, 200);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(
        body["choices"][0]["message"]["content"], "hello there",
        "client should see the assistant message"
    );

    let sent = client.seen();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].url.contains("api.openai.com"));
    assert!(sent[0]
        .headers
        .iter()
        .any(|(name, value)| name == "authorization" && value == "Bearer sk-aaaa"));

    let provider = state.pool.provider(Service::OpenAi).unwrap();
    let key = provider.list().await.into_iter().next().unwrap();
    assert_eq!(key.prompt_count, 1);
    let turbo_tokens = key.token_usage.get(&ModelFamily::Turbo).copied().unwrap();
    assert!(turbo_tokens > 0, "family token counter should advance");
    // OpenAI reuse delay is one second.
    assert!(key.rate_limited_until >= dispatch_time + 1000);
}

#[tokio::test]
async fn rate_limited_key_rotates_to_sibling_and_succeeds() {
    let client = ScriptedClient::new(vec![
        json_status(
            429,
            serde_json::json!({
                "type": "error",
                "error": {"type": "rate_limit_error", "message": "Too many requests"}
            }),
        ),
        json_200(anthropic_message("rotated fine")),
    ]);
    let state = ProxyState::for_tests(
        config_with(&[("anthropic", "sk-ant-aaaa,sk-ant-bbbb")]),
        client.clone(),
    )
    .await;

    let rate_limit_time = now_ms();
    let response = handle_blocking(
        state.clone(),
        request_for(SONNET, "token:u1", ApiFormat::OpenAiChat, false),
        "1.2.3.4".to_string(),
    )
    .await;

    assert_eq!(response.status, 200);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "rotated fine");

    // Both attempts went out with different keys.
    let sent = client.seen();
    assert_eq!(sent.len(), 2);
    let api_key = |req: &UpstreamRequest| {
        req.headers
            .iter()
            .find(|(name, _)| name == "x-api-key")
            .map(|(_, value)| value.clone())
            .unwrap()
    };
    assert_ne!(api_key(&sent[0]), api_key(&sent[1]));

    // The first key carries the anthropic lockout window.
    let provider = state.pool.provider(Service::Anthropic).unwrap();
    let limited = provider
        .list()
        .await
        .into_iter()
        .find(|key| key.rate_limited_at > 0)
        .expect("one key should be marked rate limited");
    assert!(limited.rate_limited_at >= rate_limit_time);
    assert_eq!(limited.rate_limited_until - limited.rate_limited_at, 2000);
}

#[tokio::test]
async fn revoked_key_is_disabled_and_error_is_spoofed() {
    let client = ScriptedClient::new(vec![json_status(
        401,
        serde_json::json!({"error": {"message": "Invalid API key"}}),
    )]);
    let state = ProxyState::for_tests(config_with(&[("openai", "sk-aaaa")]), client).await;

    let response = handle_blocking(
        state.clone(),
        request_for("gpt-3.5-turbo", "token:u1", ApiFormat::OpenAiChat, false),
        "1.2.3.4".to_string(),
    )
    .await;

    assert_eq!(response.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    let text = body["choices"][0]["message"]["content"].as_str().unwrap();
    assert!(text.contains("key_invalid"));

    let provider = state.pool.provider(Service::OpenAi).unwrap();
    let key = provider.list().await.into_iter().next().unwrap();
    assert!(key.is_disabled);
    assert!(key.is_revoked);
}

#[tokio::test]
async fn per_identity_limit_rejects_concurrent_second_request() {
    let client = ScriptedClient::new(vec![json_200(openai_completion("eventually"))]);
    let state = ProxyState::for_tests(config_with(&[("openai", "sk-aaaa")]), client).await;

    // Park the family behind a lockout so the first request stays queued.
    let provider = state.pool.provider(Service::OpenAi).unwrap();
    let hash = provider.list().await[0].hash.clone();
    provider.mark_rate_limited(&hash).await;

    let first = tokio::spawn(handle_blocking(
        state.clone(),
        request_for("gpt-3.5-turbo", "token:same-user", ApiFormat::OpenAiChat, false),
        "ip".to_string(),
    ));
    tokio::time::sleep(Duration::from_millis(150)).await;

    let second = handle_blocking(
        state.clone(),
        request_for("gpt-3.5-turbo", "token:same-user", ApiFormat::OpenAiChat, false),
        "ip".to_string(),
    )
    .await;
    assert_eq!(second.status, 429);

    // Lift the lockout; the queued request proceeds normally.
    provider
        .update(
            &hash,
            keymux_keys::KeyPatch {
                rate_limited_at: Some(0),
                rate_limited_until: Some(0),
                ..Default::default()
            },
        )
        .await;
    let first = first.await.unwrap();
    assert_eq!(first.status, 200);
}

#[tokio::test]
async fn transport_error_retries_on_fresh_attempt() {
    let client = ScriptedClient::new(vec![
        Canned::Transport,
        json_200(openai_completion("recovered")),
    ]);
    let state = ProxyState::for_tests(config_with(&[("openai", "sk-aaaa")]), client.clone()).await;

    let response = handle_blocking(
        state.clone(),
        request_for("gpt-3.5-turbo", "token:u1", ApiFormat::OpenAiChat, false),
        "ip".to_string(),
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(client.seen().len(), 2);
}

// ---- streaming scenarios ----

fn anthropic_stream_frames(text: &str) -> Vec<String> {
    vec![
        format!(
            "event: message_start\ndata: {}\n\n",
            serde_json::json!({
                "type": "message_start",
                "message": {
                    "id": "msg_s1", "type": "message", "role": "assistant",
                    "model": SONNET, "content": [], "stop_reason": null,
                    "usage": {"input_tokens": 9, "output_tokens": 0}
                }
            })
        ),
        format!(
            "event: content_block_delta\ndata: {}\n\n",
            serde_json::json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": text}
            })
        ),
        format!(
            "event: message_delta\ndata: {}\n\n",
            serde_json::json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                "usage": {"output_tokens": 3}
            })
        ),
        "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n".to_string(),
    ]
}

async fn collect_stream(mut rx: mpsc::Receiver<Bytes>) -> String {
    let mut out = String::new();
    while let Some(chunk) = rx.recv().await {
        out.push_str(&String::from_utf8_lossy(&chunk));
    }
    out
}

#[tokio::test]
async fn streaming_translates_upstream_events_and_terminates() {
    let client = ScriptedClient::new(vec![Canned::Sse {
        frames: anthropic_stream_frames("streamed hello"),
    }]);
    let state = ProxyState::for_tests(
        config_with(&[("anthropic", "sk-ant-aaaa")]),
        client,
    )
    .await;

    let (tx, rx) = mpsc::channel(64);
    let state_task = state.clone();
    tokio::spawn(async move {
        handle_streaming(
            state_task,
            request_for(SONNET, "token:u1", ApiFormat::OpenAiChat, true),
            "ip".to_string(),
            tx,
        )
        .await;
    });
    let output = collect_stream(rx).await;

    assert!(output.contains("joining queue at position"));
    assert!(output.contains("streamed hello"));
    assert!(output.contains("[DONE]"));

    // Usage accounted exactly once.
    let provider = state.pool.provider(Service::Anthropic).unwrap();
    let key = provider.list().await.into_iter().next().unwrap();
    assert_eq!(key.prompt_count, 1);
}

#[tokio::test]
async fn client_abort_while_queued_assigns_no_key() {
    // Upstream never consulted: the script is empty and must stay that way.
    let client = ScriptedClient::new(Vec::new());
    let state = ProxyState::for_tests(
        config_with(&[("anthropic", "sk-ant-aaaa")]),
        client.clone(),
    )
    .await;

    // Lock the family so the request parks in the queue.
    let provider = state.pool.provider(Service::Anthropic).unwrap();
    let hash = provider.list().await[0].hash.clone();
    provider.mark_rate_limited(&hash).await;

    let (tx, rx) = mpsc::channel(4);
    let state_task = state.clone();
    let driver = tokio::spawn(async move {
        handle_streaming(
            state_task,
            request_for(SONNET, "token:u1", ApiFormat::OpenAiChat, true),
            "ip".to_string(),
            tx,
        )
        .await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Client goes away before the family unlocks.
    drop(rx);
    tokio::time::timeout(Duration::from_secs(1), driver)
        .await
        .expect("driver should notice the disconnect promptly")
        .unwrap();

    assert_eq!(state.queue.len().await, 0);
    assert!(client.seen().is_empty(), "no upstream call should happen");
    let key = provider.list().await.into_iter().next().unwrap();
    assert_eq!(key.prompt_count, 0);
    // last_used untouched: the aborted request never acquired the key.
    assert_eq!(key.last_used, 0);
}

#[tokio::test]
async fn mid_stream_throttle_rate_limits_key_and_retries() {
    let overloaded = vec![format!(
        "event: error\ndata: {}\n\n",
        serde_json::json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        })
    )];
    let client = ScriptedClient::new(vec![
        Canned::Sse { frames: overloaded },
        Canned::Sse {
            frames: anthropic_stream_frames("second attempt answer"),
        },
    ]);
    let state = ProxyState::for_tests(
        config_with(&[("anthropic", "sk-ant-aaaa,sk-ant-bbbb")]),
        client.clone(),
    )
    .await;

    let (tx, rx) = mpsc::channel(64);
    let state_task = state.clone();
    tokio::spawn(async move {
        handle_streaming(
            state_task,
            request_for(SONNET, "token:u1", ApiFormat::OpenAiChat, true),
            "ip".to_string(),
            tx,
        )
        .await;
    });
    let output = collect_stream(rx).await;

    assert!(output.contains("second attempt answer"));
    assert!(output.contains("[DONE]"));
    assert_eq!(client.seen().len(), 2);

    // The throttled key took a lockout; usage landed once, on the retry key.
    let provider = state.pool.provider(Service::Anthropic).unwrap();
    let keys = provider.list().await;
    assert!(keys.iter().any(|key| key.rate_limited_at > 0));
    let total_prompts: u64 = keys.iter().map(|key| key.prompt_count).sum();
    assert_eq!(total_prompts, 1);
}
