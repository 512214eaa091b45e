//! Prompt/output token counting.
//!
//! BPE counting via tiktoken for everything: Anthropic and Gemini prompts
//! are close enough under o200k for queue weighting and quota purposes,
//! which is all these counts feed.

use keymux_protocol::openai::{ChatContent, ChatMessage};
use tiktoken_rs::{get_bpe_from_model, o200k_base};

use crate::error::ProxyError;

/// Per-message wrapping overhead applied by chat serialization.
const TOKENS_PER_MESSAGE: u64 = 4;

pub fn count_text(model: &str, text: &str) -> Result<u64, ProxyError> {
    let bpe = get_bpe_from_model(model)
        .or_else(|_| o200k_base())
        .map_err(|err| ProxyError::upstream_fatal(format!("tokenizer: {err}")))?;
    Ok(bpe.encode_ordinary(text).len() as u64)
}

pub fn count_chat_prompt(model: &str, messages: &[ChatMessage]) -> Result<u64, ProxyError> {
    let mut total = 0;
    for message in messages {
        total += TOKENS_PER_MESSAGE;
        total += count_text(model, &message.content.flat_text())?;
        if let ChatContent::Parts(parts) = &message.content {
            // Images charge a flat approximation; exact tiling costs are a
            // provider detail the queue weighting does not need.
            total += parts
                .iter()
                .filter(|part| {
                    matches!(
                        part,
                        keymux_protocol::openai::ChatContentPart::ImageUrl { .. }
                    )
                })
                .count() as u64
                * 765;
        }
    }
    Ok(total + 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_scale_with_content() {
        let short = count_text("gpt-4o", "hi").unwrap();
        let long = count_text("gpt-4o", &"word ".repeat(100)).unwrap();
        assert!(long > short);
        assert!(short >= 1);
    }

    #[test]
    fn unknown_models_fall_back_to_o200k() {
        assert!(count_text("claude-3-5-sonnet-20240620", "hello world").unwrap() > 0);
    }

    #[test]
    fn chat_count_includes_message_overhead() {
        let messages: Vec<ChatMessage> =
            serde_json::from_str(r#"[{"role":"user","content":"hi"}]"#).unwrap();
        let count = count_chat_prompt("gpt-4o", &messages).unwrap();
        assert!(count >= TOKENS_PER_MESSAGE);
    }
}
