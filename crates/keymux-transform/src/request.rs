//! One-time request translation between client and upstream schemas.
//!
//! Transformers preserve prompt intent and message order, re-key the
//! generation parameters, and set stop sequences appropriate to the target
//! schema.

use keymux_protocol::anthropic::{self, HUMAN_PREAMBLE};
use keymux_protocol::googleai;
use keymux_protocol::mistral;
use keymux_protocol::openai::{
    ChatCompletionRequest, ChatContent, ChatMessage, ChatRole, StopSequences,
};
use keymux_protocol::ApiFormat;
use serde_json::Value as JsonValue;

use crate::TransformError;

const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Dispatches on the (inbound, outbound) pair; identity pairs pass through.
pub fn transform_request(
    inbound: ApiFormat,
    outbound: ApiFormat,
    body: &JsonValue,
) -> Result<JsonValue, TransformError> {
    if inbound == outbound {
        return Ok(body.clone());
    }
    match (inbound, outbound) {
        (ApiFormat::OpenAiChat, ApiFormat::AnthropicChat) => {
            let request: ChatCompletionRequest = serde_json::from_value(body.clone())?;
            Ok(serde_json::to_value(openai_to_anthropic_chat(&request))?)
        }
        (ApiFormat::OpenAiChat, ApiFormat::AnthropicText) => {
            let request: ChatCompletionRequest = serde_json::from_value(body.clone())?;
            Ok(serde_json::to_value(openai_to_anthropic_text(&request))?)
        }
        (ApiFormat::OpenAiChat, ApiFormat::GoogleAi) => {
            let request: ChatCompletionRequest = serde_json::from_value(body.clone())?;
            Ok(serde_json::to_value(openai_to_googleai(&request))?)
        }
        (ApiFormat::OpenAiChat, ApiFormat::MistralChat) => {
            let request: ChatCompletionRequest = serde_json::from_value(body.clone())?;
            Ok(serde_json::to_value(openai_to_mistral_chat(&request))?)
        }
        (ApiFormat::OpenAiChat, ApiFormat::MistralText)
        | (ApiFormat::MistralChat, ApiFormat::MistralText) => {
            let request: mistral::ChatRequest = match inbound {
                ApiFormat::MistralChat => serde_json::from_value(body.clone())?,
                _ => {
                    let openai: ChatCompletionRequest = serde_json::from_value(body.clone())?;
                    openai_to_mistral_chat(&openai)
                }
            };
            Ok(serde_json::to_value(mistral_chat_to_text(&request))?)
        }
        (ApiFormat::AnthropicChat, ApiFormat::OpenAiChat) => {
            let request: anthropic::MessagesRequest = serde_json::from_value(body.clone())?;
            Ok(serde_json::to_value(anthropic_chat_to_openai(&request))?)
        }
        (inbound, outbound) => Err(TransformError::UnsupportedPair { inbound, outbound }),
    }
}

pub fn openai_to_anthropic_chat(request: &ChatCompletionRequest) -> anthropic::MessagesRequest {
    // Anthropic takes the system prompt out of band and alternating
    // user/assistant turns; consecutive same-role messages are merged.
    let mut system_lines: Vec<String> = Vec::new();
    let mut messages: Vec<anthropic::Message> = Vec::new();
    for message in &request.messages {
        match message.role {
            ChatRole::System => system_lines.push(message.content.flat_text()),
            role => {
                let target_role = if role == ChatRole::Assistant {
                    anthropic::MessageRole::Assistant
                } else {
                    anthropic::MessageRole::User
                };
                let blocks = content_to_blocks(&message.content);
                match messages.last_mut() {
                    Some(last) if last.role == target_role => {
                        merge_blocks(&mut last.content, blocks);
                    }
                    _ => messages.push(anthropic::Message {
                        role: target_role,
                        content: anthropic::MessageContent::Blocks(blocks),
                    }),
                }
            }
        }
    }
    if messages.is_empty() {
        messages.push(anthropic::Message {
            role: anthropic::MessageRole::User,
            content: anthropic::MessageContent::Text(String::new()),
        });
    }

    anthropic::MessagesRequest {
        model: request.model.clone(),
        messages,
        max_tokens: request.requested_output_tokens().unwrap_or(DEFAULT_MAX_TOKENS),
        system: (!system_lines.is_empty())
            .then(|| anthropic::SystemPrompt::Text(system_lines.join("\n"))),
        stop_sequences: stop_vec(request),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stream: request.stream,
        anthropic_version: None,
    }
}

pub fn openai_to_anthropic_text(
    request: &ChatCompletionRequest,
) -> anthropic::TextCompletionRequest {
    let mut prompt = String::new();
    for message in &request.messages {
        let text = message.content.flat_text();
        match message.role {
            ChatRole::System => {
                prompt.push_str(HUMAN_PREAMBLE);
                prompt.push(' ');
                prompt.push_str(&text);
            }
            ChatRole::Assistant => {
                prompt.push_str("\n\nAssistant: ");
                prompt.push_str(&text);
            }
            _ => {
                prompt.push_str(HUMAN_PREAMBLE);
                prompt.push(' ');
                prompt.push_str(&text);
            }
        }
    }
    prompt.push_str("\n\nAssistant:");

    let mut stop_sequences = stop_vec(request).unwrap_or_default();
    if !stop_sequences.iter().any(|s| s == HUMAN_PREAMBLE) {
        stop_sequences.push(HUMAN_PREAMBLE.to_string());
    }

    anthropic::TextCompletionRequest {
        model: request.model.clone(),
        prompt,
        max_tokens_to_sample: request.requested_output_tokens().unwrap_or(DEFAULT_MAX_TOKENS),
        stop_sequences: Some(stop_sequences),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stream: request.stream,
    }
}

pub fn openai_to_googleai(request: &ChatCompletionRequest) -> googleai::GenerateContentRequest {
    let mut system_lines: Vec<String> = Vec::new();
    let mut contents: Vec<googleai::Content> = Vec::new();
    for message in &request.messages {
        match message.role {
            ChatRole::System => system_lines.push(message.content.flat_text()),
            role => {
                // Google AI only knows "user" and "model".
                let target = if role == ChatRole::Assistant {
                    "model"
                } else {
                    "user"
                };
                contents.push(googleai::Content {
                    role: Some(target.to_string()),
                    parts: content_to_parts(&message.content),
                });
            }
        }
    }

    googleai::GenerateContentRequest {
        contents,
        system_instruction: (!system_lines.is_empty()).then(|| googleai::Content {
            role: None,
            parts: vec![googleai::Part::Text(system_lines.join("\n"))],
        }),
        generation_config: Some(googleai::GenerationConfig {
            max_output_tokens: request.requested_output_tokens(),
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: None,
            candidate_count: Some(1),
            stop_sequences: stop_vec(request),
        }),
        // The proxy moderates upstream of the call; relax the provider-side
        // filters to the least restrictive supported tier.
        safety_settings: Some(
            [
                "HARM_CATEGORY_HARASSMENT",
                "HARM_CATEGORY_HATE_SPEECH",
                "HARM_CATEGORY_SEXUALLY_EXPLICIT",
                "HARM_CATEGORY_DANGEROUS_CONTENT",
            ]
            .iter()
            .map(|category| googleai::SafetySetting {
                category: category.to_string(),
                threshold: "BLOCK_NONE".to_string(),
            })
            .collect(),
        ),
    }
}

pub fn openai_to_mistral_chat(request: &ChatCompletionRequest) -> mistral::ChatRequest {
    let messages = request
        .messages
        .iter()
        .map(|message| mistral::ChatMessage {
            role: message.role.as_str().to_string(),
            content: message.content.flat_text(),
        })
        .collect();
    mistral::ChatRequest {
        model: request.model.clone(),
        messages,
        max_tokens: request.requested_output_tokens(),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: stop_vec(request),
        stream: request.stream,
        safe_prompt: Some(false),
    }
}

/// Renders a chat transcript into the raw-prompt shape Bedrock's Mistral
/// models take, using the instruction-token convention.
pub fn mistral_chat_to_text(request: &mistral::ChatRequest) -> mistral::TextRequest {
    let mut prompt = String::from("<s>");
    for message in &request.messages {
        match message.role.as_str() {
            "assistant" => {
                prompt.push_str(&message.content);
                prompt.push_str("</s>");
            }
            _ => {
                prompt.push_str("[INST] ");
                prompt.push_str(&message.content);
                prompt.push_str(" [/INST]");
            }
        }
    }
    mistral::TextRequest {
        prompt,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop.clone(),
    }
}

pub fn anthropic_chat_to_openai(request: &anthropic::MessagesRequest) -> ChatCompletionRequest {
    let mut messages: Vec<ChatMessage> = Vec::new();
    if let Some(system) = &request.system {
        let text = match system {
            anthropic::SystemPrompt::Text(text) => text.clone(),
            anthropic::SystemPrompt::Blocks(blocks) => {
                anthropic::MessageContent::Blocks(blocks.clone()).flat_text()
            }
        };
        messages.push(ChatMessage {
            role: ChatRole::System,
            content: ChatContent::Text(text),
            name: None,
        });
    }
    for message in &request.messages {
        messages.push(ChatMessage {
            role: match message.role {
                anthropic::MessageRole::User => ChatRole::User,
                anthropic::MessageRole::Assistant => ChatRole::Assistant,
            },
            content: ChatContent::Text(message.content.flat_text()),
            name: None,
        });
    }
    ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        max_tokens: Some(request.max_tokens),
        max_completion_tokens: None,
        temperature: request.temperature,
        top_p: request.top_p,
        frequency_penalty: None,
        presence_penalty: None,
        stop: request
            .stop_sequences
            .clone()
            .map(StopSequences::Many),
        n: None,
        stream: request.stream,
        user: None,
        logit_bias: None,
    }
}

fn stop_vec(request: &ChatCompletionRequest) -> Option<Vec<String>> {
    request.stop.clone().map(StopSequences::into_vec)
}

fn content_to_blocks(content: &ChatContent) -> Vec<anthropic::ContentBlock> {
    match content {
        ChatContent::Text(text) => vec![anthropic::ContentBlock::Text { text: text.clone() }],
        ChatContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                keymux_protocol::openai::ChatContentPart::Text { text } => {
                    anthropic::ContentBlock::Text { text: text.clone() }
                }
                keymux_protocol::openai::ChatContentPart::ImageUrl { image_url } => {
                    let (media_type, data) = split_data_url(&image_url.url);
                    anthropic::ContentBlock::Image {
                        source: anthropic::ImageSource {
                            kind: "base64".to_string(),
                            media_type,
                            data,
                        },
                    }
                }
            })
            .collect(),
    }
}

fn content_to_parts(content: &ChatContent) -> Vec<googleai::Part> {
    match content {
        ChatContent::Text(text) => vec![googleai::Part::Text(text.clone())],
        ChatContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                keymux_protocol::openai::ChatContentPart::Text { text } => {
                    googleai::Part::Text(text.clone())
                }
                keymux_protocol::openai::ChatContentPart::ImageUrl { image_url } => {
                    let (mime_type, data) = split_data_url(&image_url.url);
                    googleai::Part::InlineData(googleai::Blob { mime_type, data })
                }
            })
            .collect(),
    }
}

fn merge_blocks(
    content: &mut anthropic::MessageContent,
    mut extra: Vec<anthropic::ContentBlock>,
) {
    match content {
        anthropic::MessageContent::Blocks(blocks) => blocks.append(&mut extra),
        anthropic::MessageContent::Text(text) => {
            let mut blocks = vec![anthropic::ContentBlock::Text { text: text.clone() }];
            blocks.append(&mut extra);
            *content = anthropic::MessageContent::Blocks(blocks);
        }
    }
}

/// `data:image/png;base64,<payload>` → (media type, payload). Anything else
/// is passed through as an opaque payload with a generic type.
fn split_data_url(url: &str) -> (String, String) {
    if let Some(rest) = url.strip_prefix("data:")
        && let Some((meta, payload)) = rest.split_once(',')
    {
        let media_type = meta.split(';').next().unwrap_or("image/png");
        return (media_type.to_string(), payload.to_string());
    }
    ("image/png".to_string(), url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_request(json: &str) -> ChatCompletionRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn anthropic_chat_round_trip_preserves_roles_and_order() {
        let original = chat_request(
            r#"{"model":"claude-3-5-sonnet-20240620","max_tokens":32,"messages":[
                {"role":"system","content":"be brief"},
                {"role":"user","content":"hi"},
                {"role":"assistant","content":"hello"},
                {"role":"user","content":"bye"}
            ]}"#,
        );
        let anthropic = openai_to_anthropic_chat(&original);
        let back = anthropic_chat_to_openai(&anthropic);

        let roles: Vec<ChatRole> = back.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                ChatRole::System,
                ChatRole::User,
                ChatRole::Assistant,
                ChatRole::User
            ]
        );
        assert_eq!(back.messages[1].content.flat_text(), "hi");
        assert_eq!(back.messages[3].content.flat_text(), "bye");
    }

    #[test]
    fn consecutive_same_role_turns_are_merged_for_anthropic() {
        let request = chat_request(
            r#"{"model":"claude-3-haiku-20240307","messages":[
                {"role":"user","content":"one"},
                {"role":"user","content":"two"}
            ]}"#,
        );
        let out = openai_to_anthropic_chat(&request);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].content.flat_text(), "one\ntwo");
    }

    #[test]
    fn text_transform_appends_preamble_stop_sequence() {
        let request = chat_request(
            r#"{"model":"claude-2.1","messages":[{"role":"user","content":"hi"}]}"#,
        );
        let out = openai_to_anthropic_text(&request);
        assert!(out.prompt.starts_with(HUMAN_PREAMBLE));
        assert!(out.prompt.ends_with("\n\nAssistant:"));
        assert!(out.stop_sequences.unwrap().contains(&HUMAN_PREAMBLE.to_string()));
    }

    #[test]
    fn googleai_transform_maps_roles_and_system_instruction() {
        let request = chat_request(
            r#"{"model":"gemini-1.5-pro","max_tokens":16,"messages":[
                {"role":"system","content":"rules"},
                {"role":"user","content":"q"},
                {"role":"assistant","content":"a"}
            ]}"#,
        );
        let out = openai_to_googleai(&request);
        assert_eq!(out.contents.len(), 2);
        assert_eq!(out.contents[0].role.as_deref(), Some("user"));
        assert_eq!(out.contents[1].role.as_deref(), Some("model"));
        assert!(out.system_instruction.is_some());
        assert_eq!(
            out.generation_config.unwrap().max_output_tokens,
            Some(16)
        );
    }

    #[test]
    fn mistral_text_uses_instruction_tokens() {
        let request = mistral::ChatRequest {
            model: "mistral.mistral-7b-instruct-v0:2".to_string(),
            messages: vec![
                mistral::ChatMessage {
                    role: "user".to_string(),
                    content: "hi".to_string(),
                },
                mistral::ChatMessage {
                    role: "assistant".to_string(),
                    content: "hello".to_string(),
                },
            ],
            max_tokens: Some(8),
            temperature: None,
            top_p: None,
            stop: None,
            stream: None,
            safe_prompt: None,
        };
        let out = mistral_chat_to_text(&request);
        assert_eq!(out.prompt, "<s>[INST] hi [/INST]hello</s>");
    }

    #[test]
    fn unsupported_pair_is_an_error() {
        let err = transform_request(
            ApiFormat::GoogleAi,
            ApiFormat::AnthropicText,
            &serde_json::json!({}),
        )
        .unwrap_err();
        assert!(matches!(err, TransformError::UnsupportedPair { .. }));
    }
}
