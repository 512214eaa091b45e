//! Wire-level types for the API formats keymux speaks.
//!
//! This crate intentionally has no IO: it holds the serde DTOs for each
//! provider schema plus the incremental decoders (SSE, AWS event-stream)
//! used by the streaming pipeline.

pub mod anthropic;
pub mod eventstream;
pub mod googleai;
pub mod mistral;
pub mod openai;
pub mod sse;

use serde::{Deserialize, Serialize};

/// API schema spoken on one side of the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiFormat {
    OpenAiChat,
    OpenAiText,
    OpenAiImage,
    AnthropicText,
    AnthropicChat,
    GoogleAi,
    MistralChat,
    MistralText,
}

impl ApiFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFormat::OpenAiChat => "openai-chat",
            ApiFormat::OpenAiText => "openai-text",
            ApiFormat::OpenAiImage => "openai-image",
            ApiFormat::AnthropicText => "anthropic-text",
            ApiFormat::AnthropicChat => "anthropic-chat",
            ApiFormat::GoogleAi => "google-ai",
            ApiFormat::MistralChat => "mistral-chat",
            ApiFormat::MistralText => "mistral-text",
        }
    }
}

impl std::fmt::Display for ApiFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
