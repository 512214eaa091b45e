//! Client-facing HTTP surface: `/proxy/{provider}/...`.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use bytes::Bytes;
use keymux_keys::{family_of, now_ms, Key, KeyDetail, ModelFamily, Service};
use keymux_protocol::ApiFormat;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use self::tokio_stream_adapter::ReceiverIntoStream;
use tracing::info;
use uuid::Uuid;

use crate::error::ProxyError;
use crate::pipeline::{handle_blocking, handle_streaming, ClientResponse};
use crate::request::ProxyRequest;
use crate::spoof::spoof_completion;
use crate::state::{ProxyState, MODELS_CACHE_TTL_MS};

/// Minimal mpsc → Stream bridge so the handler does not need tokio-stream.
mod tokio_stream_adapter {
    use bytes::Bytes;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::sync::mpsc;

    pub struct ReceiverIntoStream {
        pub rx: mpsc::Receiver<Bytes>,
    }

    impl futures_core::Stream for ReceiverIntoStream {
        type Item = Result<Bytes, std::io::Error>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.rx.poll_recv(cx).map(|item| item.map(Ok))
        }
    }
}

pub fn proxy_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/proxy/{provider}/{*path}", any(proxy_handler))
        .with_state(state)
}

async fn proxy_handler(
    State(state): State<Arc<ProxyState>>,
    Path((provider, path)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    let client_ip = client_ip(&headers);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let result = route(
        &state, &provider, &segments, &method, &uri, &headers, body, &trace_id, &client_ip,
    )
    .await;
    match result {
        Ok(response) => response,
        Err((format, error)) => {
            info!(
                event = "request_rejected",
                trace_id = %trace_id,
                provider = %provider,
                error = %error
            );
            json_response(
                error.status(),
                &spoof_completion(format, &error),
                &trace_id,
            )
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn route(
    state: &Arc<ProxyState>,
    provider: &str,
    segments: &[&str],
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
    trace_id: &str,
    client_ip: &str,
) -> Result<Response, (ApiFormat, ProxyError)> {
    let bad = |error: ProxyError| (ApiFormat::OpenAiChat, error);

    let Some(service) = Service::parse(provider) else {
        return Err(bad(ProxyError::bad_request(format!(
            "unknown provider: {provider}"
        ))));
    };

    let is_get = *method == Method::GET;
    let is_post = *method == Method::POST;

    match segments {
        ["v1", "models"] | ["v1beta", "models"] if is_get => {
            let listing = models_listing(state, service).await;
            Ok(json_response(StatusCode::OK, &listing, trace_id))
        }
        ["v1", "chat", "completions"] if is_post => {
            dispatch_generation(
                state,
                service,
                ApiFormat::OpenAiChat,
                headers,
                uri,
                body,
                trace_id,
                client_ip,
                None,
            )
            .await
        }
        ["v1", "messages"] if is_post => {
            dispatch_generation(
                state,
                service,
                ApiFormat::AnthropicChat,
                headers,
                uri,
                body,
                trace_id,
                client_ip,
                None,
            )
            .await
        }
        ["v1", "complete"] if is_post => {
            dispatch_generation(
                state,
                service,
                ApiFormat::AnthropicText,
                headers,
                uri,
                body,
                trace_id,
                client_ip,
                None,
            )
            .await
        }
        ["v1", "images", "generations"] if is_post => {
            dispatch_generation(
                state,
                service,
                ApiFormat::OpenAiImage,
                headers,
                uri,
                body,
                trace_id,
                client_ip,
                None,
            )
            .await
        }
        ["v1beta", "models", model_action] if is_post => {
            let (model, action) = match model_action.split_once(':') {
                Some((model, action)) => (model.to_string(), action),
                None => {
                    return Err(bad(ProxyError::bad_request("missing model action")));
                }
            };
            let streaming_path = match action {
                "generateContent" => false,
                "streamGenerateContent" => true,
                other => {
                    return Err(bad(ProxyError::bad_request(format!(
                        "unsupported action: {other}"
                    ))));
                }
            };
            dispatch_generation(
                state,
                service,
                ApiFormat::GoogleAi,
                headers,
                uri,
                body,
                trace_id,
                client_ip,
                Some((model, streaming_path)),
            )
            .await
        }
        _ => Err(bad(ProxyError::bad_request("unknown route"))),
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_generation(
    state: &Arc<ProxyState>,
    route_service: Service,
    inbound: ApiFormat,
    headers: &HeaderMap,
    uri: &Uri,
    body: Bytes,
    trace_id: &str,
    client_ip: &str,
    google_path: Option<(String, bool)>,
) -> Result<Response, (ApiFormat, ProxyError)> {
    let err = |error: ProxyError| (inbound, error);

    let parsed: JsonValue = if body.is_empty() {
        JsonValue::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| err(ProxyError::bad_request(format!("invalid json: {e}"))))?
    };

    let model = match &google_path {
        Some((model, _)) => model.clone(),
        None => parsed
            .get("model")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .ok_or_else(|| err(ProxyError::bad_request("request body is missing a model")))?,
    };
    let family = family_of(&model)
        .ok_or_else(|| err(ProxyError::bad_request(format!("unknown model: {model}"))))?;
    if family.service() != route_service {
        return Err(err(ProxyError::bad_request(format!(
            "model {model} is not served by the {} routes",
            route_service
        ))));
    }

    let streaming = match &google_path {
        Some((_, streaming_path)) => *streaming_path,
        None => {
            inbound != ApiFormat::OpenAiImage
                && parsed
                    .get("stream")
                    .and_then(|s| s.as_bool())
                    .unwrap_or(false)
        }
    };

    let request = ProxyRequest {
        id: trace_id.to_string(),
        identity: identity(headers, client_ip),
        inbound_format: inbound,
        outbound_format: outbound_format(inbound, family),
        service: family.service(),
        model,
        model_family: family,
        body: parsed,
        headers: header_pairs(headers),
        path: String::new(),
        key: None,
        signed: None,
        streaming,
        start_time: now_ms(),
        queue_out_time: 0,
        retry_count: 0,
        prompt_tokens: 0,
        output_tokens: 0,
    };
    info!(
        event = "downstream_received",
        trace_id = %trace_id,
        provider = %route_service,
        model = %request.model,
        family = %request.model_family,
        inbound = %request.inbound_format,
        outbound = %request.outbound_format,
        is_stream = streaming,
        path = %uri.path()
    );

    if streaming {
        let (tx, rx) = mpsc::channel::<Bytes>(32);
        let task_state = state.clone();
        let ip = client_ip.to_string();
        tokio::spawn(async move {
            handle_streaming(task_state, request, ip, tx).await;
        });
        let stream = ReceiverIntoStream { rx };
        let mut response = Response::new(Body::from_stream(stream));
        let response_headers = response.headers_mut();
        response_headers.insert("content-type", HeaderValue::from_static("text/event-stream"));
        response_headers.insert("cache-control", HeaderValue::from_static("no-cache"));
        response_headers.insert("connection", HeaderValue::from_static("keep-alive"));
        response_headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        if let Ok(value) = HeaderValue::from_str(trace_id) {
            response_headers.insert("x-keymux-request-id", value);
        }
        Ok(response)
    } else {
        let outcome = handle_blocking(state.clone(), request, client_ip.to_string()).await;
        Ok(client_response(outcome, trace_id))
    }
}

/// Inbound/family pair → the schema spoken to the upstream service.
fn outbound_format(inbound: ApiFormat, family: ModelFamily) -> ApiFormat {
    match family.service() {
        Service::OpenAi | Service::Azure => {
            if inbound == ApiFormat::OpenAiImage {
                ApiFormat::OpenAiImage
            } else {
                ApiFormat::OpenAiChat
            }
        }
        Service::Anthropic => {
            if inbound == ApiFormat::AnthropicText {
                ApiFormat::AnthropicText
            } else {
                ApiFormat::AnthropicChat
            }
        }
        Service::Aws => {
            if family == ModelFamily::AwsMistral {
                ApiFormat::MistralText
            } else {
                ApiFormat::AnthropicChat
            }
        }
        Service::Gcp => ApiFormat::AnthropicChat,
        Service::GoogleAi => ApiFormat::GoogleAi,
        Service::Mistral => ApiFormat::MistralChat,
    }
}

/// Queue identity: user token when present, alternate key header next, then
/// the client address.
fn identity(headers: &HeaderMap, client_ip: &str) -> String {
    if let Some(token) = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    {
        return format!("token:{token}");
    }
    for header in ["x-api-key", "api-key"] {
        if let Some(value) = headers.get(header).and_then(|value| value.to_str().ok()) {
            return format!("token:{value}");
        }
    }
    format!("ip:{client_ip}")
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| "direct".to_string())
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn client_response(outcome: ClientResponse, trace_id: &str) -> Response {
    let mut response = Response::new(Body::from(outcome.body));
    *response.status_mut() =
        StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in outcome.headers {
        if let (Ok(name), Ok(value)) = (
            axum::http::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        response.headers_mut().insert("x-keymux-request-id", value);
    }
    response
}

fn json_response(status: StatusCode, body: &JsonValue, trace_id: &str) -> Response {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        response.headers_mut().insert("x-keymux-request-id", value);
    }
    response
}

/// Models visible across the provider's enabled keys, cached for a minute.
async fn models_listing(state: &Arc<ProxyState>, service: Service) -> JsonValue {
    let now = now_ms();
    {
        let cache = state.models_cache.lock().await;
        if let Some((built_at, listing)) = cache.get(&service) {
            if now.saturating_sub(*built_at) < MODELS_CACHE_TTL_MS {
                return listing.clone();
            }
        }
    }

    let keys: Vec<Key> = match state.pool.provider(service) {
        Some(provider) => provider.list().await,
        None => Vec::new(),
    };

    let mut ids: BTreeSet<String> = BTreeSet::new();
    for key in keys.iter().filter(|key| !key.is_disabled) {
        match &key.detail {
            KeyDetail::OpenAi { model_ids, .. }
            | KeyDetail::Aws { model_ids, .. }
            | KeyDetail::Azure { model_ids, .. } => {
                ids.extend(model_ids.iter().cloned());
            }
            _ => {}
        }
        for family in &key.model_families {
            ids.insert(family.as_str().to_string());
        }
    }

    let created = (now / 1000) as i64;
    let listing = serde_json::json!({
        "object": "list",
        "data": ids
            .into_iter()
            .map(|id| serde_json::json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": service.as_str(),
            }))
            .collect::<Vec<_>>(),
    });

    let mut cache = state.models_cache.lock().await;
    cache.insert(service, (now, listing.clone()));
    listing
}
