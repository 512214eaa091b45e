//! Blocking response translation through the internal OpenAI chat shape.

use keymux_protocol::anthropic;
use keymux_protocol::googleai;
use keymux_protocol::mistral;
use keymux_protocol::openai::{
    AssistantMessage, ChatChoice, ChatCompletionResponse, ChatRole, FinishReason, TextChoice,
    TextCompletionResponse, Usage,
};
use keymux_protocol::ApiFormat;
use serde_json::Value as JsonValue;

use crate::TransformError;

/// Upstream blocking body (already JSON) → internal chat response.
pub fn upstream_to_internal(
    outbound: ApiFormat,
    body: &JsonValue,
) -> Result<ChatCompletionResponse, TransformError> {
    match outbound {
        ApiFormat::OpenAiChat => Ok(serde_json::from_value(body.clone())?),
        ApiFormat::AnthropicChat => {
            let response: anthropic::MessagesResponse = serde_json::from_value(body.clone())?;
            Ok(anthropic_messages_to_internal(&response))
        }
        ApiFormat::AnthropicText => {
            let response: anthropic::TextCompletionResponse =
                serde_json::from_value(body.clone())?;
            Ok(anthropic_text_to_internal(&response))
        }
        ApiFormat::GoogleAi => {
            let response: googleai::GenerateContentResponse =
                serde_json::from_value(body.clone())?;
            Ok(googleai_to_internal(&response))
        }
        ApiFormat::MistralChat => {
            let response: mistral::ChatResponse = serde_json::from_value(body.clone())?;
            Ok(mistral_chat_to_internal(&response))
        }
        ApiFormat::MistralText => {
            let response: mistral::TextResponse = serde_json::from_value(body.clone())?;
            Ok(mistral_text_to_internal(&response))
        }
        other => Err(TransformError::UnsupportedPair {
            inbound: ApiFormat::OpenAiChat,
            outbound: other,
        }),
    }
}

/// Internal chat response → the client's declared format.
pub fn internal_to_client(
    inbound: ApiFormat,
    response: &ChatCompletionResponse,
) -> Result<JsonValue, TransformError> {
    match inbound {
        ApiFormat::OpenAiChat => Ok(serde_json::to_value(response)?),
        ApiFormat::OpenAiText => Ok(serde_json::to_value(internal_to_openai_text(response))?),
        ApiFormat::AnthropicChat => {
            Ok(serde_json::to_value(internal_to_anthropic_messages(response))?)
        }
        ApiFormat::AnthropicText => {
            Ok(serde_json::to_value(internal_to_anthropic_text(response))?)
        }
        ApiFormat::GoogleAi => Ok(serde_json::to_value(internal_to_googleai(response))?),
        ApiFormat::MistralChat => Ok(serde_json::to_value(internal_to_mistral_chat(response))?),
        ApiFormat::MistralText => Ok(serde_json::to_value(internal_to_mistral_text(response))?),
        other => Err(TransformError::UnsupportedPair {
            inbound: other,
            outbound: ApiFormat::OpenAiChat,
        }),
    }
}

fn first_text(response: &ChatCompletionResponse) -> &str {
    response
        .choices
        .first()
        .map(|choice| choice.message.content.as_str())
        .unwrap_or("")
}

fn first_finish(response: &ChatCompletionResponse) -> Option<FinishReason> {
    response.choices.first().and_then(|choice| choice.finish_reason)
}

pub fn anthropic_messages_to_internal(
    response: &anthropic::MessagesResponse,
) -> ChatCompletionResponse {
    let text = response
        .content
        .iter()
        .filter_map(|block| match block {
            anthropic::ContentBlock::Text { text } => Some(text.as_str()),
            anthropic::ContentBlock::Image { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("");
    ChatCompletionResponse {
        id: response.id.clone(),
        object: "chat.completion".to_string(),
        created: 0,
        model: response.model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: ChatRole::Assistant,
                content: text,
            },
            finish_reason: response.stop_reason.map(stop_to_finish),
        }],
        usage: Some(Usage {
            prompt_tokens: response.usage.input_tokens,
            completion_tokens: response.usage.output_tokens,
            total_tokens: response.usage.input_tokens + response.usage.output_tokens,
        }),
    }
}

pub fn anthropic_text_to_internal(
    response: &anthropic::TextCompletionResponse,
) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: response.id.clone(),
        object: "chat.completion".to_string(),
        created: 0,
        model: response.model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: ChatRole::Assistant,
                content: response.completion.clone(),
            },
            finish_reason: response.stop_reason.map(stop_to_finish),
        }],
        usage: None,
    }
}

pub fn googleai_to_internal(response: &googleai::GenerateContentResponse) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: "gemini".to_string(),
        object: "chat.completion".to_string(),
        created: 0,
        model: "gemini".to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: ChatRole::Assistant,
                content: response.first_candidate_text(),
            },
            finish_reason: response
                .candidates
                .first()
                .and_then(|candidate| candidate.finish_reason)
                .map(googleai_finish_to_internal),
        }],
        usage: response.usage_metadata.as_ref().map(|usage| Usage {
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
            total_tokens: usage.total_token_count,
        }),
    }
}

pub fn mistral_chat_to_internal(response: &mistral::ChatResponse) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: response.id.clone(),
        object: "chat.completion".to_string(),
        created: response.created,
        model: response.model.clone(),
        choices: response
            .choices
            .iter()
            .map(|choice| ChatChoice {
                index: choice.index,
                message: AssistantMessage {
                    role: ChatRole::Assistant,
                    content: choice.message.content.clone(),
                },
                finish_reason: choice
                    .finish_reason
                    .as_deref()
                    .map(mistral_finish_to_internal),
            })
            .collect(),
        usage: response.usage.as_ref().map(|usage| Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }),
    }
}

pub fn mistral_text_to_internal(response: &mistral::TextResponse) -> ChatCompletionResponse {
    let output = response.outputs.first();
    ChatCompletionResponse {
        id: "mistral".to_string(),
        object: "chat.completion".to_string(),
        created: 0,
        model: "mistral".to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: ChatRole::Assistant,
                content: output.map(|o| o.text.clone()).unwrap_or_default(),
            },
            finish_reason: output
                .and_then(|o| o.stop_reason.as_deref())
                .map(mistral_finish_to_internal),
        }],
        usage: None,
    }
}

pub fn internal_to_openai_text(response: &ChatCompletionResponse) -> TextCompletionResponse {
    TextCompletionResponse {
        id: response.id.clone(),
        object: "text_completion".to_string(),
        created: response.created,
        model: response.model.clone(),
        choices: response
            .choices
            .iter()
            .map(|choice| TextChoice {
                index: choice.index,
                text: choice.message.content.clone(),
                finish_reason: choice.finish_reason,
            })
            .collect(),
        usage: response.usage.clone(),
    }
}

pub fn internal_to_anthropic_messages(
    response: &ChatCompletionResponse,
) -> anthropic::MessagesResponse {
    let usage = response.usage.clone().unwrap_or_default();
    anthropic::MessagesResponse {
        id: response.id.clone(),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: response.model.clone(),
        content: vec![anthropic::ContentBlock::Text {
            text: first_text(response).to_string(),
        }],
        stop_reason: Some(finish_to_stop(first_finish(response))),
        stop_sequence: None,
        usage: anthropic::MessagesUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        },
    }
}

pub fn internal_to_anthropic_text(
    response: &ChatCompletionResponse,
) -> anthropic::TextCompletionResponse {
    anthropic::TextCompletionResponse {
        kind: "completion".to_string(),
        id: response.id.clone(),
        completion: first_text(response).to_string(),
        stop_reason: Some(finish_to_stop(first_finish(response))),
        model: response.model.clone(),
    }
}

pub fn internal_to_googleai(
    response: &ChatCompletionResponse,
) -> googleai::GenerateContentResponse {
    googleai::GenerateContentResponse {
        candidates: vec![googleai::Candidate {
            content: googleai::Content {
                role: Some("model".to_string()),
                parts: vec![googleai::Part::Text(first_text(response).to_string())],
            },
            finish_reason: Some(match first_finish(response) {
                Some(FinishReason::Length) => googleai::FinishReason::MaxTokens,
                Some(FinishReason::ContentFilter) => googleai::FinishReason::Safety,
                _ => googleai::FinishReason::Stop,
            }),
            index: Some(0),
        }],
        usage_metadata: response.usage.as_ref().map(|usage| googleai::UsageMetadata {
            prompt_token_count: usage.prompt_tokens,
            candidates_token_count: usage.completion_tokens,
            total_token_count: usage.total_tokens,
        }),
        prompt_feedback: None,
    }
}

pub fn internal_to_mistral_chat(response: &ChatCompletionResponse) -> mistral::ChatResponse {
    mistral::ChatResponse {
        id: response.id.clone(),
        object: "chat.completion".to_string(),
        created: response.created,
        model: response.model.clone(),
        choices: response
            .choices
            .iter()
            .map(|choice| mistral::ChatChoice {
                index: choice.index,
                message: mistral::ChatMessage {
                    role: "assistant".to_string(),
                    content: choice.message.content.clone(),
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
        usage: response.usage.as_ref().map(|usage| mistral::ChatUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }),
    }
}

pub fn internal_to_mistral_text(response: &ChatCompletionResponse) -> mistral::TextResponse {
    mistral::TextResponse {
        outputs: vec![mistral::TextOutput {
            text: first_text(response).to_string(),
            stop_reason: Some(
                match first_finish(response) {
                    Some(FinishReason::Length) => "length",
                    _ => "stop",
                }
                .to_string(),
            ),
        }],
    }
}

fn stop_to_finish(stop: anthropic::StopReason) -> FinishReason {
    match stop {
        anthropic::StopReason::EndTurn => FinishReason::Stop,
        anthropic::StopReason::MaxTokens => FinishReason::Length,
        anthropic::StopReason::StopSequence => FinishReason::Stop,
        anthropic::StopReason::Unknown => FinishReason::Unknown,
    }
}

fn finish_to_stop(finish: Option<FinishReason>) -> anthropic::StopReason {
    match finish {
        Some(FinishReason::Length) => anthropic::StopReason::MaxTokens,
        Some(FinishReason::Stop) | None => anthropic::StopReason::EndTurn,
        Some(_) => anthropic::StopReason::EndTurn,
    }
}

fn googleai_finish_to_internal(reason: googleai::FinishReason) -> FinishReason {
    match reason {
        googleai::FinishReason::Stop => FinishReason::Stop,
        googleai::FinishReason::MaxTokens => FinishReason::Length,
        googleai::FinishReason::Safety | googleai::FinishReason::Recitation => {
            FinishReason::ContentFilter
        }
        googleai::FinishReason::Unknown => FinishReason::Unknown,
    }
}

fn mistral_finish_to_internal(reason: &str) -> FinishReason {
    match reason {
        "length" | "model_length" => FinishReason::Length,
        "stop" => FinishReason::Stop,
        _ => FinishReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_messages_round_trip_to_client_format() {
        let raw = serde_json::json!({
            "id": "msg_01", "type": "message", "role": "assistant",
            "model": "claude-3-5-sonnet-20240620",
            "content": [{"type": "text", "text": "hello there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 3}
        });
        let internal = upstream_to_internal(ApiFormat::AnthropicChat, &raw).unwrap();
        assert_eq!(internal.choices[0].message.content, "hello there");
        assert_eq!(internal.usage.as_ref().unwrap().prompt_tokens, 10);

        let back = internal_to_client(ApiFormat::AnthropicChat, &internal).unwrap();
        assert_eq!(back["content"][0]["text"], "hello there");
        assert_eq!(back["stop_reason"], "end_turn");
    }

    #[test]
    fn googleai_response_maps_finish_and_usage() {
        let raw = serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "hey"}]},
                            "finishReason": "MAX_TOKENS"}],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 1,
                              "totalTokenCount": 5}
        });
        let internal = upstream_to_internal(ApiFormat::GoogleAi, &raw).unwrap();
        assert_eq!(internal.choices[0].finish_reason, Some(FinishReason::Length));
        assert_eq!(internal.usage.as_ref().unwrap().total_tokens, 5);
    }

    #[test]
    fn openai_text_render_flattens_message() {
        let internal = ChatCompletionResponse {
            id: "cmpl-1".to_string(),
            object: "chat.completion".to_string(),
            created: 7,
            model: "gpt-4o".to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: ChatRole::Assistant,
                    content: "text out".to_string(),
                },
                finish_reason: Some(FinishReason::Stop),
            }],
            usage: None,
        };
        let rendered = internal_to_client(ApiFormat::OpenAiText, &internal).unwrap();
        assert_eq!(rendered["choices"][0]["text"], "text out");
        assert_eq!(rendered["object"], "text_completion");
    }
}
