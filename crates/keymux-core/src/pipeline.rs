//! The staged request lifecycle: preprocess → enqueue → dequeue → mutate →
//! dispatch → response handling, with transparent retry via the reversible
//! mutation log.

use std::sync::Arc;

use bytes::Bytes;
use keymux_keys::{now_ms, KeyDetail, KeyPatch, Service};
use keymux_protocol::eventstream::EventStreamDecoder;
use keymux_protocol::sse::{encode_comment, SseDecoder, SseEvent};
use keymux_queue::{
    payload, payload_size, Dequeue, EnqueueError, FlushMonitor, QueuedHandle, Ticket,
    HEARTBEAT_INTERVAL, JOIN_TIMEOUT,
};
use keymux_transform::aggregate::ChunkAggregator;
use keymux_transform::response::{internal_to_client, upstream_to_internal};
use keymux_transform::stream::adapter_for;
use keymux_transform::stream::out::renderer_for;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::classify::{classify, KeyFlag, UpstreamFailure, UpstreamOutcome};
use crate::decompress::decompress;
use crate::error::{ErrorKind, ProxyError};
use crate::manager::RequestManager;
use crate::mutate::{apply_mutators, MutateCtx};
use crate::request::ProxyRequest;
use crate::spoof::{spoof_completion, spoof_stream};
use crate::state::ProxyState;
use crate::tokens::count_text;
use crate::upstream::{UpstreamBody, UpstreamRequest, UpstreamResponse};

/// Response headers never copied back to the client.
const DROPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-encoding",
    "content-length",
    "transfer-encoding",
    "connection",
    "set-cookie",
    "openai-organization",
    "x-request-id",
];

#[derive(Debug)]
pub struct ClientResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ClientResponse {
    fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(body.to_string()),
        }
    }
}

fn error_response(request: &ProxyRequest, error: &ProxyError) -> ClientResponse {
    ClientResponse::json(
        error.status().as_u16(),
        &spoof_completion(request.inbound_format, error),
    )
}

// ---- blocking path ----

pub async fn handle_blocking(
    state: Arc<ProxyState>,
    mut request: ProxyRequest,
    client_ip: String,
) -> ClientResponse {
    let config = state.config.load_full();
    if let Err(error) =
        crate::preprocess::run_preprocessors(&mut request, &client_ip, &config, &state.preprocess)
            .await
    {
        return error_response(&request, &error);
    }

    let ticket = ticket_for(&request);
    let handle = match state.queue.enqueue(ticket.clone()).await {
        Ok(handle) => handle,
        Err(error) => return error_response(&request, &enqueue_error(error)),
    };
    request.start_time = handle.start_ms;

    let mut manager = RequestManager::new(request);
    let mut handle = Some(handle);
    loop {
        match await_turn(handle.take()).await {
            Ok(()) => {}
            Err(error) => return error_response(manager.request(), &error),
        }

        match attempt_blocking(&state, &mut manager).await {
            AttemptOutcome::Done(response) => return response,
            AttemptOutcome::Retry => {
                manager.revert();
                let retries = manager.request().retry_count;
                manager.request_mut().retry_count = retries + 1;
                handle = Some(state.queue.reenqueue(ticket.clone(), retries).await);
            }
        }
    }
}

enum AttemptOutcome {
    Done(ClientResponse),
    Retry,
}

async fn attempt_blocking(
    state: &Arc<ProxyState>,
    manager: &mut RequestManager,
) -> AttemptOutcome {
    manager.request_mut().queue_out_time = now_ms();
    let ctx = MutateCtx {
        pool: &state.pool,
        gcp_tokens: &state.gcp_tokens,
        client: state.client.as_ref(),
    };
    if let Err(error) = apply_mutators(manager, &ctx).await {
        return AttemptOutcome::Done(error_response(manager.request(), &error));
    }

    let upstream = match dispatch(state, manager, false).await {
        Ok(upstream) => upstream,
        Err(transport) => {
            info!(
                event = "upstream_transport_error",
                request_id = %manager.request().id,
                error = %transport.redacted()
            );
            return AttemptOutcome::Retry;
        }
    };

    let status = upstream.status;
    let headers = upstream.headers.clone();
    let body = match upstream.body {
        UpstreamBody::Buffered(bytes) => bytes,
        UpstreamBody::Stream(mut rx) => {
            let mut collected = Vec::new();
            while let Some(chunk) = rx.recv().await {
                collected.extend_from_slice(&chunk);
            }
            Bytes::from(collected)
        }
    };
    let encoding = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-encoding"))
        .map(|(_, value)| value.as_str());
    let body = match decompress(encoding, body) {
        Ok(body) => body,
        Err(error) => return AttemptOutcome::Done(error_response(manager.request(), &error)),
    };

    track_rate_limit_headers(state, manager, &headers).await;

    if (200..300).contains(&status) {
        let response = finish_blocking_success(state, manager, status, &headers, &body).await;
        return AttemptOutcome::Done(response);
    }

    match apply_failure(state, manager, status, &headers, &body).await {
        FailureDisposition::Retry => AttemptOutcome::Retry,
        FailureDisposition::Surface(error) => {
            AttemptOutcome::Done(error_response(manager.request(), &error))
        }
    }
}

async fn finish_blocking_success(
    state: &Arc<ProxyState>,
    manager: &mut RequestManager,
    status: u16,
    headers: &[(String, String)],
    body: &Bytes,
) -> ClientResponse {
    // Mutations have served their purpose; the client response is built from
    // the pre-mutation view plus the upstream body.
    let is_json = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.contains("json"))
        .unwrap_or(true);
    manager.revert();
    let request = manager.request().clone();

    if !is_json || request.inbound_format == keymux_protocol::ApiFormat::OpenAiImage {
        return passthrough_response(status, headers, body.clone());
    }

    let parsed: serde_json::Value = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(_) => return passthrough_response(status, headers, body.clone()),
    };
    let internal = match upstream_to_internal(request.outbound_format, &parsed) {
        Ok(internal) => internal,
        Err(err) => {
            warn!(
                event = "response_transform_failed",
                request_id = %request.id,
                error = %err
            );
            return passthrough_response(status, headers, body.clone());
        }
    };

    let output_tokens = match internal.usage.as_ref() {
        Some(usage) => usage.completion_tokens,
        None => internal
            .choices
            .first()
            .and_then(|choice| count_text(&request.model, &choice.message.content).ok())
            .unwrap_or(0),
    };
    account_usage(state, &request, output_tokens).await;

    let client_body = match internal_to_client(request.inbound_format, &internal) {
        Ok(body) => body,
        Err(_) => parsed,
    };
    let mut response = ClientResponse::json(200, &client_body);
    for (name, value) in headers {
        let lowered = name.to_ascii_lowercase();
        if DROPPED_RESPONSE_HEADERS.contains(&lowered.as_str()) || lowered == "content-type" {
            continue;
        }
        response.headers.push((name.clone(), value.clone()));
    }
    response
}

fn passthrough_response(status: u16, headers: &[(String, String)], body: Bytes) -> ClientResponse {
    let mut out = ClientResponse {
        status,
        headers: Vec::new(),
        body,
    };
    for (name, value) in headers {
        if DROPPED_RESPONSE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        out.headers.push((name.clone(), value.clone()));
    }
    out
}

// ---- streaming path ----

/// Drives a streaming request, writing SSE frames into `tx`. The response
/// headers were already sent by the HTTP layer; every outcome, including
/// errors, is rendered into the stream.
pub async fn handle_streaming(
    state: Arc<ProxyState>,
    mut request: ProxyRequest,
    client_ip: String,
    tx: mpsc::Sender<Bytes>,
) {
    let config = state.config.load_full();
    if let Err(error) =
        crate::preprocess::run_preprocessors(&mut request, &client_ip, &config, &state.preprocess)
            .await
    {
        write_spoofed_error(&tx, &request, &error).await;
        return;
    }

    let ticket = ticket_for(&request);
    let handle = match state.queue.enqueue(ticket.clone()).await {
        Ok(handle) => handle,
        Err(error) => {
            write_spoofed_error(&tx, &request, &enqueue_error(error)).await;
            return;
        }
    };
    request.start_time = handle.start_ms;

    // Join comment must drain promptly or the socket is considered dead.
    let join = encode_comment(&format!("joining queue at position {}", handle.position));
    match tokio::time::timeout(JOIN_TIMEOUT, tx.send(Bytes::from(join))).await {
        Ok(Ok(())) => {}
        _ => {
            state.queue.remove(&ticket.id).await;
            return;
        }
    }

    let request_id = request.id.clone();
    let mut manager = RequestManager::new(request);
    let mut renderer = match renderer_for(manager.request().inbound_format) {
        Ok(renderer) => renderer,
        Err(err) => {
            write_spoofed_error(&tx, manager.request(), &ProxyError::bad_request(err.to_string()))
                .await;
            return;
        }
    };
    let mut aggregator = ChunkAggregator::new();

    let mut handle = Some(handle);
    loop {
        let turn = match wait_with_heartbeats(&state, &ticket, handle.take(), &tx).await {
            WaitOutcome::Ready => Ok(()),
            WaitOutcome::Killed => Err(ProxyError::new(
                ErrorKind::UpstreamFatal,
                "request spent too long in the queue",
            )),
            WaitOutcome::ClientGone => {
                state.queue.remove(&ticket.id).await;
                return;
            }
        };
        if let Err(error) = turn {
            write_spoofed_error(&tx, manager.request(), &error).await;
            return;
        }

        match attempt_streaming(&state, &mut manager, &tx, &mut renderer, &mut aggregator).await {
            StreamAttempt::Finished => {
                finish_stream_accounting(&state, &manager, &aggregator).await;
                return;
            }
            StreamAttempt::ClientGone => {
                info!(event = "stream_client_gone", request_id = %request_id);
                if aggregator.has_events() {
                    finish_stream_accounting(&state, &manager, &aggregator).await;
                }
                return;
            }
            StreamAttempt::Fatal(error) => {
                write_spoofed_error_into(&tx, &mut *renderer, &error).await;
                return;
            }
            StreamAttempt::Retry | StreamAttempt::RetryThrottled => {
                manager.revert();
                let retries = manager.request().retry_count;
                manager.request_mut().retry_count = retries + 1;
                // The retry restarts generation; drop partial aggregation so
                // usage is counted once, from the attempt that completes.
                aggregator = ChunkAggregator::new();
                handle = Some(state.queue.reenqueue(ticket.clone(), retries).await);
            }
        }
    }
}

enum WaitOutcome {
    Ready,
    Killed,
    ClientGone,
}

async fn wait_with_heartbeats(
    state: &Arc<ProxyState>,
    ticket: &Ticket,
    handle: Option<QueuedHandle>,
    tx: &mpsc::Sender<Bytes>,
) -> WaitOutcome {
    let Some(handle) = handle else {
        return WaitOutcome::Killed;
    };
    let mut rx = handle.rx;
    let mut beat = tokio::time::interval(HEARTBEAT_INTERVAL);
    beat.tick().await;
    let mut monitor = FlushMonitor::new();
    loop {
        tokio::select! {
            turn = &mut rx => {
                return match turn {
                    Ok(Dequeue::Ready) => WaitOutcome::Ready,
                    Ok(Dequeue::Killed) => WaitOutcome::Killed,
                    Err(_) => WaitOutcome::Killed,
                };
            }
            // Client disconnect fires the close path immediately; the caller
            // removes the queue entry before any key is assigned.
            _ = tx.closed() => {
                return WaitOutcome::ClientGone;
            }
            _ = beat.tick() => {
                let load = state.queue.len().await;
                let threshold = state.config.load().load_threshold;
                let body = payload(payload_size(load, threshold));
                let frame = Bytes::from(encode_comment(&body));
                monitor.on_write(frame.len());
                match tx.try_send(frame) {
                    Ok(()) => monitor.on_flush(body.len()),
                    Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        return WaitOutcome::ClientGone;
                    }
                }
                if monitor.on_interval() {
                    warn!(event = "stream_client_unresponsive", request_id = %ticket.id);
                    return WaitOutcome::ClientGone;
                }
            }
        }
    }
}

enum StreamAttempt {
    Finished,
    /// Transient failure with no upstream pushback (transport drop).
    Retry,
    /// Upstream throttled mid-stream; the key takes a lockout.
    RetryThrottled,
    Fatal(ProxyError),
    ClientGone,
}

async fn attempt_streaming(
    state: &Arc<ProxyState>,
    manager: &mut RequestManager,
    tx: &mpsc::Sender<Bytes>,
    renderer: &mut Box<dyn keymux_transform::stream::out::StreamRenderer>,
    aggregator: &mut ChunkAggregator,
) -> StreamAttempt {
    if tx.is_closed() {
        return StreamAttempt::ClientGone;
    }
    manager.request_mut().queue_out_time = now_ms();
    let ctx = MutateCtx {
        pool: &state.pool,
        gcp_tokens: &state.gcp_tokens,
        client: state.client.as_ref(),
    };
    if let Err(error) = apply_mutators(manager, &ctx).await {
        return StreamAttempt::Fatal(error);
    }

    let upstream = match dispatch(state, manager, true).await {
        Ok(upstream) => upstream,
        Err(transport) => {
            info!(
                event = "upstream_transport_error",
                request_id = %manager.request().id,
                error = %transport.redacted()
            );
            return StreamAttempt::Retry;
        }
    };

    if !(200..300).contains(&upstream.status) {
        let status = upstream.status;
        let headers = upstream.headers.clone();
        let body = match upstream.body {
            UpstreamBody::Buffered(bytes) => bytes,
            UpstreamBody::Stream(_) => Bytes::new(),
        };
        return match apply_failure(state, manager, status, &headers, &body).await {
            FailureDisposition::Retry => StreamAttempt::Retry,
            FailureDisposition::Surface(error) => StreamAttempt::Fatal(error),
        };
    }

    track_rate_limit_headers(state, manager, &upstream.headers).await;
    let is_eventstream = upstream
        .header("content-type")
        .map(|value| value.contains("eventstream"))
        .unwrap_or(false);
    let UpstreamBody::Stream(rx) = upstream.body else {
        return StreamAttempt::Fatal(ProxyError::upstream_fatal(
            "upstream answered a stream request without a stream",
        ));
    };

    let outcome = pump_stream(
        manager,
        rx,
        is_eventstream,
        tx,
        renderer.as_mut(),
        aggregator,
    )
    .await;
    if let StreamAttempt::RetryThrottled = outcome {
        if let Some(key) = &manager.request().key {
            state.pool.mark_rate_limited(key.service, &key.hash).await;
        }
    }
    outcome
}

/// Decodes upstream bytes (SSE or AWS event-stream), adapts them to internal
/// chunks, renders the client's format, and aggregates for accounting.
async fn pump_stream(
    manager: &RequestManager,
    mut rx: mpsc::Receiver<Bytes>,
    is_eventstream: bool,
    tx: &mpsc::Sender<Bytes>,
    renderer: &mut dyn keymux_transform::stream::out::StreamRenderer,
    aggregator: &mut ChunkAggregator,
) -> StreamAttempt {
    let request = manager.request();
    let mut adapter = match adapter_for(request.outbound_format) {
        Ok(adapter) => adapter,
        Err(err) => return StreamAttempt::Fatal(ProxyError::upstream_fatal(err.to_string())),
    };
    let mut sse = SseDecoder::new();
    let mut frames = EventStreamDecoder::new();
    let mut saw_done = false;

    while let Some(chunk) = rx.recv().await {
        let events: Vec<SseEvent> = if is_eventstream {
            match decode_eventstream_chunk(&mut frames, &chunk) {
                Ok(events) => events,
                Err(disposition) => return disposition,
            }
        } else {
            sse.feed(&chunk)
        };

        for event in events {
            if event.is_done() {
                saw_done = true;
                continue;
            }
            let chunks = match adapter.adapt(&event) {
                Ok(chunks) => chunks,
                Err(err) => {
                    // Mid-stream upstream error payloads come through here.
                    let text = err.to_string();
                    if text.contains("overloaded") || text.contains("rate") {
                        return StreamAttempt::RetryThrottled;
                    }
                    return StreamAttempt::Fatal(ProxyError::upstream_fatal(text));
                }
            };
            for chunk in chunks {
                aggregator.push(&chunk);
                let rendered = match renderer.render(&chunk) {
                    Ok(rendered) => rendered,
                    Err(err) => {
                        return StreamAttempt::Fatal(ProxyError::upstream_fatal(err.to_string()))
                    }
                };
                for out in rendered {
                    if tx.send(Bytes::from(out.encode())).await.is_err() {
                        return StreamAttempt::ClientGone;
                    }
                }
            }
        }
    }

    if !saw_done && !aggregator.has_events() {
        // Connection died before any content: safe to retry transparently.
        return StreamAttempt::Retry;
    }
    for out in renderer.finish() {
        if tx.send(Bytes::from(out.encode())).await.is_err() {
            return StreamAttempt::ClientGone;
        }
    }
    StreamAttempt::Finished
}

fn decode_eventstream_chunk(
    frames: &mut EventStreamDecoder,
    chunk: &Bytes,
) -> Result<Vec<SseEvent>, StreamAttempt> {
    use base64::Engine;

    let decoded = frames
        .feed(chunk)
        .map_err(|err| StreamAttempt::Fatal(ProxyError::upstream_fatal(err.to_string())))?;
    let mut events = Vec::new();
    for frame in decoded {
        if frame.is_exception() {
            let exception = frame.exception_type.clone().unwrap_or_default();
            if exception.contains("throttling") || exception.contains("Throttling") {
                return Err(StreamAttempt::RetryThrottled);
            }
            return Err(StreamAttempt::Fatal(ProxyError::upstream_fatal(format!(
                "upstream stream exception: {exception}"
            ))));
        }
        // Bedrock chunk payloads wrap the inner JSON in {"bytes": base64}.
        let payload: serde_json::Value = match serde_json::from_slice(&frame.payload) {
            Ok(payload) => payload,
            Err(_) => continue,
        };
        let inner = payload
            .get("bytes")
            .and_then(|bytes| bytes.as_str())
            .and_then(|b64| {
                base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .ok()
            })
            .and_then(|raw| String::from_utf8(raw).ok());
        match inner {
            Some(inner) => events.push(SseEvent::data(inner)),
            None => events.push(SseEvent::data(payload.to_string())),
        }
    }
    Ok(events)
}

async fn finish_stream_accounting(
    state: &Arc<ProxyState>,
    manager: &RequestManager,
    aggregator: &ChunkAggregator,
) {
    let request = manager.request();
    let finalized = aggregator.finalize();
    let output_tokens = match finalized.usage.as_ref() {
        Some(usage) if usage.completion_tokens > 0 => usage.completion_tokens,
        _ => finalized
            .choices
            .first()
            .and_then(|choice| count_text(&request.model, &choice.message.content).ok())
            .unwrap_or(0),
    };
    account_usage(state, request, output_tokens).await;
}

// ---- shared helpers ----

fn ticket_for(request: &ProxyRequest) -> Ticket {
    Ticket {
        id: request.id.clone(),
        identity: request.identity.clone(),
        family: request.model_family,
        prompt_tokens: request.prompt_tokens,
        output_tokens: request.output_tokens,
        streaming: request.streaming,
    }
}

fn enqueue_error(error: EnqueueError) -> ProxyError {
    match error {
        EnqueueError::TooManyRequests => ProxyError::new(
            ErrorKind::TooManyRequests,
            "you already have a request in the queue",
        ),
        EnqueueError::StreamRequired => ProxyError::bad_request(
            "proxy is under heavy load; retry with \"stream\": true",
        ),
    }
}

async fn await_turn(handle: Option<QueuedHandle>) -> Result<(), ProxyError> {
    let Some(handle) = handle else {
        return Err(ProxyError::upstream_fatal("queue handle missing"));
    };
    match handle.rx.await {
        Ok(Dequeue::Ready) => Ok(()),
        Ok(Dequeue::Killed) | Err(_) => Err(ProxyError::new(
            ErrorKind::UpstreamFatal,
            "request spent too long in the queue",
        )),
    }
}

async fn dispatch(
    state: &Arc<ProxyState>,
    manager: &RequestManager,
    want_stream: bool,
) -> Result<UpstreamResponse, crate::upstream::TransportError> {
    let request = manager.request();
    let mut upstream_request = match &request.signed {
        Some(signed) => UpstreamRequest {
            method: signed.method.clone(),
            url: format!("https://{}{}", signed.hostname, signed.path),
            headers: signed.headers.clone(),
            body: Some(signed.body.clone()),
            want_stream,
        },
        None => UpstreamRequest {
            method: "POST".to_string(),
            url: request.path.clone(),
            headers: request.headers.clone(),
            body: Some(Bytes::from(request.body.to_string())),
            want_stream,
        },
    };
    if want_stream
        && !upstream_request
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("accept-encoding"))
    {
        // Streams are decoded incrementally; a compressed stream cannot be.
        upstream_request
            .headers
            .push(("accept-encoding".to_string(), "identity".to_string()));
    }
    info!(
        event = "upstream_dispatch",
        request_id = %request.id,
        service = %request.service,
        model = %request.model,
        attempt = request.retry_count + 1,
        key = %request.key.as_ref().map(|k| k.hash.clone()).unwrap_or_default(),
        stream = want_stream
    );
    state.client.send(upstream_request).await
}

enum FailureDisposition {
    Retry,
    Surface(ProxyError),
}

async fn apply_failure(
    state: &Arc<ProxyState>,
    manager: &RequestManager,
    status: u16,
    headers: &[(String, String)],
    body: &Bytes,
) -> FailureDisposition {
    let request = manager.request();
    let body_text = String::from_utf8_lossy(body).to_string();
    let amzn = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("x-amzn-errortype"))
        .map(|(_, value)| value.as_str());
    let outcome = classify(&UpstreamFailure {
        service: request.service,
        status,
        amzn_errortype: amzn,
        body: &body_text,
    });
    let Some(key) = request.key.clone() else {
        return FailureDisposition::Surface(ProxyError::upstream_fatal(
            "upstream failure before key assignment",
        ));
    };

    info!(
        event = "upstream_failure",
        request_id = %request.id,
        key = %key.hash,
        status,
        outcome = ?outcome_label(&outcome)
    );
    match outcome {
        UpstreamOutcome::RateLimitRetry => {
            state.pool.mark_rate_limited(key.service, &key.hash).await;
            FailureDisposition::Retry
        }
        UpstreamOutcome::KeyFlagRetry(flag) => {
            apply_key_flag(state, &key, flag).await;
            FailureDisposition::Retry
        }
        UpstreamOutcome::DisableKey { revoke, error } => {
            state.pool.disable(&key, revoke).await;
            FailureDisposition::Surface(error)
        }
        UpstreamOutcome::Surface(error) => FailureDisposition::Surface(error),
    }
}

fn outcome_label(outcome: &UpstreamOutcome) -> &'static str {
    match outcome {
        UpstreamOutcome::RateLimitRetry => "rate_limit_retry",
        UpstreamOutcome::KeyFlagRetry(_) => "key_flag_retry",
        UpstreamOutcome::DisableKey { .. } => "disable_key",
        UpstreamOutcome::Surface(_) => "surface",
    }
}

async fn apply_key_flag(state: &Arc<ProxyState>, key: &keymux_keys::Key, flag: KeyFlag) {
    let KeyDetail::Anthropic {
        tier,
        is_pozzed,
        is_over_quota,
        requires_preamble,
        allows_multimodality,
    } = &key.detail
    else {
        return;
    };
    let detail = match flag {
        KeyFlag::RequiresPreamble => KeyDetail::Anthropic {
            tier: *tier,
            is_pozzed: *is_pozzed,
            is_over_quota: *is_over_quota,
            requires_preamble: true,
            allows_multimodality: *allows_multimodality,
        },
        KeyFlag::NoMultimodality => KeyDetail::Anthropic {
            tier: *tier,
            is_pozzed: *is_pozzed,
            is_over_quota: *is_over_quota,
            requires_preamble: *requires_preamble,
            allows_multimodality: false,
        },
    };
    state
        .pool
        .update(
            key.service,
            &key.hash,
            KeyPatch {
                detail: Some(detail),
                ..Default::default()
            },
        )
        .await;
}

async fn track_rate_limit_headers(
    state: &Arc<ProxyState>,
    manager: &RequestManager,
    headers: &[(String, String)],
) {
    let request = manager.request();
    if request.service != Service::OpenAi {
        return;
    }
    let Some(key) = &request.key else {
        return;
    };
    let find = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };
    state
        .pool
        .update_rate_limits(
            &key.hash,
            find("x-ratelimit-reset-requests"),
            find("x-ratelimit-reset-tokens"),
        )
        .await;
}

async fn account_usage(state: &Arc<ProxyState>, request: &ProxyRequest, output_tokens: u64) {
    let Some(key) = &request.key else {
        return;
    };
    state
        .pool
        .increment_usage(key, &request.model, request.prompt_tokens + output_tokens)
        .await;
    info!(
        event = "usage_recorded",
        request_id = %request.id,
        key = %key.hash,
        prompt_tokens = request.prompt_tokens,
        output_tokens
    );
}

async fn write_spoofed_error(
    tx: &mpsc::Sender<Bytes>,
    request: &ProxyRequest,
    error: &ProxyError,
) {
    for event in spoof_stream(request.inbound_format, error) {
        if tx.send(Bytes::from(event.encode())).await.is_err() {
            return;
        }
    }
}

async fn write_spoofed_error_into(
    tx: &mpsc::Sender<Bytes>,
    renderer: &mut dyn keymux_transform::stream::out::StreamRenderer,
    error: &ProxyError,
) {
    // Reuse the live renderer so an already-started Anthropic stream gets a
    // coherent tail instead of a second message_start.
    let chunk = keymux_protocol::openai::ChatCompletionChunk::delta(
        &format!("error-{}", error.label()),
        "proxy",
        (now_ms() / 1000) as i64,
        format!("**Proxy error ({})**\n\n{}", error.label(), error.message),
    );
    let finish = keymux_protocol::openai::ChatCompletionChunk::finish(
        &format!("error-{}", error.label()),
        "proxy",
        (now_ms() / 1000) as i64,
        keymux_protocol::openai::FinishReason::Stop,
    );
    for piece in [chunk, finish] {
        if let Ok(events) = renderer.render(&piece) {
            for event in events {
                if tx.send(Bytes::from(event.encode())).await.is_err() {
                    return;
                }
            }
        }
    }
    for event in renderer.finish() {
        let _ = tx.send(Bytes::from(event.encode())).await;
    }
}
