//! Internal chunk → client-format SSE renderers.

use keymux_protocol::anthropic;
use keymux_protocol::googleai;
use keymux_protocol::mistral;
use keymux_protocol::openai::{ChatCompletionChunk, FinishReason};
use keymux_protocol::sse::{DONE_DATA, SseEvent};
use keymux_protocol::ApiFormat;

use crate::TransformError;

pub trait StreamRenderer: Send {
    fn render(&mut self, chunk: &ChatCompletionChunk) -> Result<Vec<SseEvent>, TransformError>;

    /// Events that terminate a well-formed stream in this format.
    fn finish(&mut self) -> Vec<SseEvent>;
}

pub fn renderer_for(inbound: ApiFormat) -> Result<Box<dyn StreamRenderer>, TransformError> {
    match inbound {
        ApiFormat::OpenAiChat | ApiFormat::OpenAiText => Ok(Box::new(OpenAiRenderer)),
        ApiFormat::AnthropicChat => Ok(Box::new(AnthropicChatRenderer::default())),
        ApiFormat::AnthropicText => Ok(Box::new(AnthropicTextRenderer)),
        ApiFormat::GoogleAi => Ok(Box::new(GoogleAiRenderer)),
        ApiFormat::MistralChat => Ok(Box::new(MistralChatRenderer)),
        ApiFormat::MistralText => Ok(Box::new(MistralTextRenderer)),
        other => Err(TransformError::UnsupportedPair {
            inbound: other,
            outbound: ApiFormat::OpenAiChat,
        }),
    }
}

struct OpenAiRenderer;

impl StreamRenderer for OpenAiRenderer {
    fn render(&mut self, chunk: &ChatCompletionChunk) -> Result<Vec<SseEvent>, TransformError> {
        Ok(vec![SseEvent::data(serde_json::to_string(chunk)?)])
    }

    fn finish(&mut self) -> Vec<SseEvent> {
        vec![SseEvent::data(DONE_DATA)]
    }
}

/// Emits the full Anthropic chat event sequence: `message_start`,
/// `content_block_start`, deltas, `content_block_stop`, `message_delta`,
/// `message_stop`.
#[derive(Default)]
pub struct AnthropicChatRenderer {
    started: bool,
    block_closed: bool,
    stop_emitted: bool,
    output_tokens: u64,
}

impl AnthropicChatRenderer {
    fn start_events(&mut self, chunk: &ChatCompletionChunk) -> Vec<SseEvent> {
        self.started = true;
        let start = anthropic::StreamEvent::MessageStart {
            message: anthropic::MessageStart {
                id: chunk.id.clone(),
                kind: "message".to_string(),
                role: "assistant".to_string(),
                model: chunk.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                usage: anthropic::MessagesUsage::default(),
            },
        };
        let block_start = anthropic::StreamEvent::ContentBlockStart {
            index: 0,
            content_block: anthropic::ContentBlock::Text {
                text: String::new(),
            },
        };
        vec![named(&start), named(&block_start)]
    }
}

impl StreamRenderer for AnthropicChatRenderer {
    fn render(&mut self, chunk: &ChatCompletionChunk) -> Result<Vec<SseEvent>, TransformError> {
        let mut events = Vec::new();
        if !self.started {
            events.extend(self.start_events(chunk));
        }
        if let Some(usage) = &chunk.usage {
            self.output_tokens = usage.completion_tokens;
        }
        for choice in &chunk.choices {
            if let Some(text) = &choice.delta.content
                && !text.is_empty()
            {
                events.push(named(&anthropic::StreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: anthropic::ContentDelta::TextDelta { text: text.clone() },
                }));
            }
            if let Some(reason) = choice.finish_reason {
                events.extend(self.stop_events(reason));
            }
        }
        Ok(events)
    }

    fn finish(&mut self) -> Vec<SseEvent> {
        // A stream that never carried a finish reason still closes cleanly.
        if self.stop_emitted {
            return Vec::new();
        }
        self.stop_events(FinishReason::Stop)
    }
}

impl AnthropicChatRenderer {
    fn stop_events(&mut self, reason: FinishReason) -> Vec<SseEvent> {
        if self.stop_emitted {
            return Vec::new();
        }
        self.stop_emitted = true;
        let mut events = Vec::new();
        if !self.block_closed {
            self.block_closed = true;
            events.push(named(&anthropic::StreamEvent::ContentBlockStop { index: 0 }));
        }
        events.push(named(&anthropic::StreamEvent::MessageDelta {
            delta: anthropic::MessageDelta {
                stop_reason: Some(match reason {
                    FinishReason::Length => anthropic::StopReason::MaxTokens,
                    _ => anthropic::StopReason::EndTurn,
                }),
                stop_sequence: None,
            },
            usage: Some(anthropic::DeltaUsage {
                output_tokens: self.output_tokens,
            }),
        }));
        events.push(named(&anthropic::StreamEvent::MessageStop));
        events
    }
}

struct AnthropicTextRenderer;

impl StreamRenderer for AnthropicTextRenderer {
    fn render(&mut self, chunk: &ChatCompletionChunk) -> Result<Vec<SseEvent>, TransformError> {
        let mut events = Vec::new();
        for choice in &chunk.choices {
            let completion = choice.delta.content.clone().unwrap_or_default();
            let stop_reason = choice.finish_reason.map(|reason| match reason {
                FinishReason::Length => anthropic::StopReason::MaxTokens,
                _ => anthropic::StopReason::StopSequence,
            });
            if completion.is_empty() && stop_reason.is_none() {
                continue;
            }
            let event = anthropic::TextCompletionEvent {
                kind: "completion".to_string(),
                completion,
                stop_reason,
            };
            events.push(SseEvent::named(
                "completion",
                serde_json::to_string(&event)?,
            ));
        }
        Ok(events)
    }

    fn finish(&mut self) -> Vec<SseEvent> {
        vec![SseEvent::data(DONE_DATA)]
    }
}

struct GoogleAiRenderer;

impl StreamRenderer for GoogleAiRenderer {
    fn render(&mut self, chunk: &ChatCompletionChunk) -> Result<Vec<SseEvent>, TransformError> {
        let mut events = Vec::new();
        for choice in &chunk.choices {
            let text = choice.delta.content.clone().unwrap_or_default();
            let finish = choice.finish_reason.map(|reason| match reason {
                FinishReason::Length => googleai::FinishReason::MaxTokens,
                FinishReason::ContentFilter => googleai::FinishReason::Safety,
                _ => googleai::FinishReason::Stop,
            });
            if text.is_empty() && finish.is_none() {
                continue;
            }
            let payload = googleai::GenerateContentResponse {
                candidates: vec![googleai::Candidate {
                    content: googleai::Content {
                        role: Some("model".to_string()),
                        parts: vec![googleai::Part::Text(text)],
                    },
                    finish_reason: finish,
                    index: Some(0),
                }],
                usage_metadata: chunk.usage.as_ref().map(|usage| googleai::UsageMetadata {
                    prompt_token_count: usage.prompt_tokens,
                    candidates_token_count: usage.completion_tokens,
                    total_token_count: usage.total_tokens,
                }),
                prompt_feedback: None,
            };
            events.push(SseEvent::data(serde_json::to_string(&payload)?));
        }
        Ok(events)
    }

    fn finish(&mut self) -> Vec<SseEvent> {
        Vec::new()
    }
}

struct MistralChatRenderer;

impl StreamRenderer for MistralChatRenderer {
    fn render(&mut self, chunk: &ChatCompletionChunk) -> Result<Vec<SseEvent>, TransformError> {
        let payload = mistral::ChatChunk {
            id: chunk.id.clone(),
            model: chunk.model.clone(),
            choices: chunk
                .choices
                .iter()
                .map(|choice| mistral::ChunkChoice {
                    index: choice.index,
                    delta: mistral::ChunkDelta {
                        role: choice.delta.role.map(|role| role.as_str().to_string()),
                        content: choice.delta.content.clone(),
                    },
                    finish_reason: choice.finish_reason.map(|reason| {
                        match reason {
                            FinishReason::Length => "length",
                            _ => "stop",
                        }
                        .to_string()
                    }),
                })
                .collect(),
            usage: chunk.usage.as_ref().map(|usage| mistral::ChatUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            }),
        };
        Ok(vec![SseEvent::data(serde_json::to_string(&payload)?)])
    }

    fn finish(&mut self) -> Vec<SseEvent> {
        vec![SseEvent::data(DONE_DATA)]
    }
}

struct MistralTextRenderer;

impl StreamRenderer for MistralTextRenderer {
    fn render(&mut self, chunk: &ChatCompletionChunk) -> Result<Vec<SseEvent>, TransformError> {
        let mut events = Vec::new();
        for choice in &chunk.choices {
            let text = choice.delta.content.clone().unwrap_or_default();
            let stop_reason = choice.finish_reason.map(|reason| {
                match reason {
                    FinishReason::Length => "length",
                    _ => "stop",
                }
                .to_string()
            });
            if text.is_empty() && stop_reason.is_none() {
                continue;
            }
            let payload = mistral::TextResponse {
                outputs: vec![mistral::TextOutput { text, stop_reason }],
            };
            events.push(SseEvent::data(serde_json::to_string(&payload)?));
        }
        Ok(events)
    }

    fn finish(&mut self) -> Vec<SseEvent> {
        vec![SseEvent::data(DONE_DATA)]
    }
}

fn named(event: &anthropic::StreamEvent) -> SseEvent {
    SseEvent::named(
        event.wire_name(),
        serde_json::to_string(event).unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_chat_renderer_emits_full_sequence() {
        let mut renderer = renderer_for(ApiFormat::AnthropicChat).unwrap();
        let delta = ChatCompletionChunk::delta("msg_1", "claude-3-opus-20240229", 0, "hi".into());
        let finish =
            ChatCompletionChunk::finish("msg_1", "claude-3-opus-20240229", 0, FinishReason::Stop);

        let mut names: Vec<String> = Vec::new();
        for chunk in [&delta, &finish] {
            for event in renderer.render(chunk).unwrap() {
                names.push(event.event.unwrap_or_default());
            }
        }
        names.extend(renderer.finish().into_iter().map(|e| e.event.unwrap_or_default()));

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
    fn openai_renderer_terminates_with_done() {
        let mut renderer = renderer_for(ApiFormat::OpenAiChat).unwrap();
        let chunk = ChatCompletionChunk::delta("c", "gpt-4o", 0, "x".into());
        let events = renderer.render(&chunk).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].data.contains("\"content\":\"x\""));
        assert!(renderer.finish()[0].is_done());
    }
}
