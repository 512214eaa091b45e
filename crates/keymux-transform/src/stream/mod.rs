//! Upstream SSE → internal chunk adapters.
//!
//! Each adapter consumes one provider's streaming events and synthesizes
//! OpenAI chat chunks, the internal event model. State (message id, model,
//! creation time) is carried across events so every synthesized chunk is
//! self-describing.

pub mod out;

use keymux_protocol::anthropic;
use keymux_protocol::googleai;
use keymux_protocol::mistral;
use keymux_protocol::openai::{ChatCompletionChunk, FinishReason, Usage};
use keymux_protocol::sse::SseEvent;
use keymux_protocol::ApiFormat;

use crate::TransformError;

pub trait SseAdapter: Send {
    /// Converts one upstream event into zero or more internal chunks.
    fn adapt(&mut self, event: &SseEvent) -> Result<Vec<ChatCompletionChunk>, TransformError>;
}

/// Adapter for the upstream's outbound format. OpenAI-format upstreams pass
/// through (modulo parse) so identical client/upstream formats stay
/// byte-faithful at the event level.
pub fn adapter_for(outbound: ApiFormat) -> Result<Box<dyn SseAdapter>, TransformError> {
    match outbound {
        ApiFormat::OpenAiChat => Ok(Box::new(OpenAiChatAdapter)),
        ApiFormat::AnthropicChat => Ok(Box::new(AnthropicChatAdapter::default())),
        ApiFormat::AnthropicText => Ok(Box::new(AnthropicTextAdapter::default())),
        ApiFormat::GoogleAi => Ok(Box::new(GoogleAiAdapter::default())),
        ApiFormat::MistralChat => Ok(Box::new(MistralChatAdapter)),
        ApiFormat::MistralText => Ok(Box::new(MistralTextAdapter::default())),
        other => Err(TransformError::UnsupportedPair {
            inbound: ApiFormat::OpenAiChat,
            outbound: other,
        }),
    }
}

struct OpenAiChatAdapter;

impl SseAdapter for OpenAiChatAdapter {
    fn adapt(&mut self, event: &SseEvent) -> Result<Vec<ChatCompletionChunk>, TransformError> {
        if event.is_done() || event.data.is_empty() {
            return Ok(Vec::new());
        }
        let chunk: ChatCompletionChunk = serde_json::from_str(&event.data)?;
        Ok(vec![chunk])
    }
}

#[derive(Default)]
struct AnthropicChatAdapter {
    id: String,
    model: String,
    output_tokens: u64,
}

impl SseAdapter for AnthropicChatAdapter {
    fn adapt(&mut self, event: &SseEvent) -> Result<Vec<ChatCompletionChunk>, TransformError> {
        if event.data.is_empty() {
            return Ok(Vec::new());
        }
        let parsed: anthropic::StreamEvent = serde_json::from_str(&event.data)?;
        let chunks = match parsed {
            anthropic::StreamEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                Vec::new()
            }
            anthropic::StreamEvent::ContentBlockDelta { delta, .. } => {
                let anthropic::ContentDelta::TextDelta { text } = delta;
                vec![ChatCompletionChunk::delta(&self.id, &self.model, 0, text)]
            }
            anthropic::StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.output_tokens = usage.output_tokens;
                }
                match delta.stop_reason {
                    Some(stop) => {
                        let mut chunk = ChatCompletionChunk::finish(
                            &self.id,
                            &self.model,
                            0,
                            stop_to_finish(stop),
                        );
                        chunk.usage = Some(Usage {
                            prompt_tokens: 0,
                            completion_tokens: self.output_tokens,
                            total_tokens: self.output_tokens,
                        });
                        vec![chunk]
                    }
                    None => Vec::new(),
                }
            }
            anthropic::StreamEvent::Error { error } => {
                return Err(TransformError::BadPayload(format!(
                    "{}: {}",
                    error.kind, error.message
                )));
            }
            anthropic::StreamEvent::ContentBlockStart { .. }
            | anthropic::StreamEvent::ContentBlockStop { .. }
            | anthropic::StreamEvent::MessageStop
            | anthropic::StreamEvent::Ping => Vec::new(),
        };
        Ok(chunks)
    }
}

#[derive(Default)]
struct AnthropicTextAdapter {
    finished: bool,
}

impl SseAdapter for AnthropicTextAdapter {
    fn adapt(&mut self, event: &SseEvent) -> Result<Vec<ChatCompletionChunk>, TransformError> {
        if event.data.is_empty() || self.finished {
            return Ok(Vec::new());
        }
        if event.event.as_deref() == Some("ping") {
            return Ok(Vec::new());
        }
        let parsed: anthropic::TextCompletionEvent = serde_json::from_str(&event.data)?;
        let mut chunks = Vec::new();
        if !parsed.completion.is_empty() {
            chunks.push(ChatCompletionChunk::delta(
                "compl",
                "claude",
                0,
                parsed.completion,
            ));
        }
        if let Some(stop) = parsed.stop_reason {
            self.finished = true;
            chunks.push(ChatCompletionChunk::finish(
                "compl",
                "claude",
                0,
                stop_to_finish(stop),
            ));
        }
        Ok(chunks)
    }
}

#[derive(Default)]
struct GoogleAiAdapter {
    prompt_tokens: u64,
    output_tokens: u64,
}

impl SseAdapter for GoogleAiAdapter {
    fn adapt(&mut self, event: &SseEvent) -> Result<Vec<ChatCompletionChunk>, TransformError> {
        if event.data.is_empty() {
            return Ok(Vec::new());
        }
        let parsed: googleai::GenerateContentResponse = serde_json::from_str(&event.data)?;
        if let Some(usage) = &parsed.usage_metadata {
            self.prompt_tokens = usage.prompt_token_count;
            self.output_tokens = usage.candidates_token_count;
        }
        let mut chunks = Vec::new();
        let text = parsed.first_candidate_text();
        if !text.is_empty() {
            chunks.push(ChatCompletionChunk::delta("gemini", "gemini", 0, text));
        }
        if let Some(reason) = parsed
            .candidates
            .first()
            .and_then(|candidate| candidate.finish_reason)
        {
            let mut chunk = ChatCompletionChunk::finish(
                "gemini",
                "gemini",
                0,
                match reason {
                    googleai::FinishReason::MaxTokens => FinishReason::Length,
                    googleai::FinishReason::Safety | googleai::FinishReason::Recitation => {
                        FinishReason::ContentFilter
                    }
                    _ => FinishReason::Stop,
                },
            );
            chunk.usage = Some(Usage {
                prompt_tokens: self.prompt_tokens,
                completion_tokens: self.output_tokens,
                total_tokens: self.prompt_tokens + self.output_tokens,
            });
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

struct MistralChatAdapter;

impl SseAdapter for MistralChatAdapter {
    fn adapt(&mut self, event: &SseEvent) -> Result<Vec<ChatCompletionChunk>, TransformError> {
        if event.is_done() || event.data.is_empty() {
            return Ok(Vec::new());
        }
        let parsed: mistral::ChatChunk = serde_json::from_str(&event.data)?;
        let mut chunks = Vec::new();
        for choice in parsed.choices {
            if let Some(text) = choice.delta.content
                && !text.is_empty()
            {
                chunks.push(ChatCompletionChunk::delta(&parsed.id, &parsed.model, 0, text));
            }
            if let Some(reason) = choice.finish_reason {
                let mut chunk = ChatCompletionChunk::finish(
                    &parsed.id,
                    &parsed.model,
                    0,
                    match reason.as_str() {
                        "length" | "model_length" => FinishReason::Length,
                        _ => FinishReason::Stop,
                    },
                );
                chunk.usage = parsed.usage.as_ref().map(|usage| Usage {
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    total_tokens: usage.total_tokens,
                });
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }
}

#[derive(Default)]
struct MistralTextAdapter {
    finished: bool,
}

impl SseAdapter for MistralTextAdapter {
    fn adapt(&mut self, event: &SseEvent) -> Result<Vec<ChatCompletionChunk>, TransformError> {
        if event.is_done() || event.data.is_empty() || self.finished {
            return Ok(Vec::new());
        }
        let parsed: mistral::TextResponse = serde_json::from_str(&event.data)?;
        let mut chunks = Vec::new();
        for output in parsed.outputs {
            if !output.text.is_empty() {
                chunks.push(ChatCompletionChunk::delta(
                    "mistral",
                    "mistral",
                    0,
                    output.text,
                ));
            }
            if let Some(reason) = output.stop_reason {
                self.finished = true;
                chunks.push(ChatCompletionChunk::finish(
                    "mistral",
                    "mistral",
                    0,
                    match reason.as_str() {
                        "length" => FinishReason::Length,
                        _ => FinishReason::Stop,
                    },
                ));
            }
        }
        Ok(chunks)
    }
}

fn stop_to_finish(stop: anthropic::StopReason) -> FinishReason {
    match stop {
        anthropic::StopReason::MaxTokens => FinishReason::Length,
        anthropic::StopReason::Unknown => FinishReason::Unknown,
        _ => FinishReason::Stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_chat_stream_becomes_chunks() {
        let mut adapter = adapter_for(ApiFormat::AnthropicChat).unwrap();
        let start = SseEvent::named(
            "message_start",
            r#"{"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","model":"claude-3-5-sonnet-20240620","content":[],"stop_reason":null,"usage":{"input_tokens":9,"output_tokens":0}}}"#,
        );
        assert!(adapter.adapt(&start).unwrap().is_empty());

        let delta = SseEvent::named(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
        );
        let chunks = adapter.adapt(&delta).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "msg_1");
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("Hi"));

        let finish = SseEvent::named(
            "message_delta",
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn","stop_sequence":null},"usage":{"output_tokens":2}}"#,
        );
        let chunks = adapter.adapt(&finish).unwrap();
        assert_eq!(chunks[0].choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(chunks[0].usage.as_ref().unwrap().completion_tokens, 2);
    }

    #[test]
    fn googleai_stream_carries_stop_reason() {
        let mut adapter = adapter_for(ApiFormat::GoogleAi).unwrap();
        let event = SseEvent::data(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"out"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":2,"candidatesTokenCount":1,"totalTokenCount":3}}"#,
        );
        let chunks = adapter.adapt(&event).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("out"));
        assert_eq!(chunks[1].choices[0].finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn openai_passthrough_ignores_done() {
        let mut adapter = adapter_for(ApiFormat::OpenAiChat).unwrap();
        assert!(adapter.adapt(&SseEvent::data("[DONE]")).unwrap().is_empty());
    }
}
