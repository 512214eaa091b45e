//! Renders proxy errors as provider-shaped completions so chat frontends
//! display them inline instead of swallowing an error body.

use keymux_protocol::openai::{
    AssistantMessage, ChatChoice, ChatCompletionChunk, ChatCompletionResponse, ChatRole,
    FinishReason,
};
use keymux_protocol::sse::SseEvent;
use keymux_protocol::ApiFormat;
use keymux_transform::response::internal_to_client;
use keymux_transform::stream::out::renderer_for;
use serde_json::Value as JsonValue;

use crate::error::ProxyError;

fn spoof_text(error: &ProxyError) -> String {
    format!("**Proxy error ({})**\n\n{}", error.label(), error.message)
}

/// Blocking path: a completion envelope in the client's format carrying the
/// error text as the assistant turn.
pub fn spoof_completion(inbound: ApiFormat, error: &ProxyError) -> JsonValue {
    let internal = ChatCompletionResponse {
        id: format!("error-{}", error.label()),
        object: "chat.completion".to_string(),
        created: (keymux_keys::now_ms() / 1000) as i64,
        model: "proxy".to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: ChatRole::Assistant,
                content: spoof_text(error),
            },
            finish_reason: Some(FinishReason::Stop),
        }],
        usage: None,
    };
    internal_to_client(inbound, &internal).unwrap_or_else(|_| {
        serde_json::json!({
            "error": { "type": error.label(), "message": error.message }
        })
    })
}

/// Streaming path: the full event sequence the client's format expects,
/// terminated the way a healthy stream would be.
pub fn spoof_stream(inbound: ApiFormat, error: &ProxyError) -> Vec<SseEvent> {
    let Ok(mut renderer) = renderer_for(inbound) else {
        return vec![SseEvent::data(
            serde_json::json!({
                "error": { "type": error.label(), "message": error.message }
            })
            .to_string(),
        )];
    };
    let delta = ChatCompletionChunk::delta(
        &format!("error-{}", error.label()),
        "proxy",
        (keymux_keys::now_ms() / 1000) as i64,
        spoof_text(error),
    );
    let finish = ChatCompletionChunk::finish(
        &format!("error-{}", error.label()),
        "proxy",
        (keymux_keys::now_ms() / 1000) as i64,
        FinishReason::Stop,
    );
    let mut events = Vec::new();
    events.extend(renderer.render(&delta).unwrap_or_default());
    events.extend(renderer.render(&finish).unwrap_or_default());
    events.extend(renderer.finish());
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_stream_spoof_carries_full_event_sequence() {
        let error = ProxyError::upstream_fatal("boom");
        let events = spoof_stream(ApiFormat::AnthropicChat, &error);
        let names: Vec<_> = events
            .iter()
            .filter_map(|event| event.event.as_deref())
            .collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
    }

    #[test]
    fn openai_blocking_spoof_is_a_completion() {
        let error = ProxyError::bad_request("bad payload");
        let body = spoof_completion(ApiFormat::OpenAiChat, &error);
        assert!(
            body["choices"][0]["message"]["content"]
                .as_str()
                .unwrap()
                .contains("bad payload")
        );
    }

    #[test]
    fn openai_stream_spoof_ends_with_done() {
        let error = ProxyError::upstream_fatal("x");
        let events = spoof_stream(ApiFormat::OpenAiChat, &error);
        assert!(events.last().unwrap().is_done());
    }
}
