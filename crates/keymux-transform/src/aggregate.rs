//! Folds internal chunks into a finalized blocking response, so the
//! post-stream middleware (usage accounting, logging) sees a fully
//! assembled body even for streamed requests.

use std::collections::BTreeMap;

use keymux_protocol::openai::{
    AssistantMessage, ChatChoice, ChatCompletionChunk, ChatCompletionResponse, ChatRole,
    FinishReason, Usage,
};

#[derive(Debug, Default)]
struct ChoiceState {
    content: String,
    finish_reason: Option<FinishReason>,
}

#[derive(Debug, Default)]
pub struct ChunkAggregator {
    id: Option<String>,
    model: Option<String>,
    created: i64,
    usage: Option<Usage>,
    choices: BTreeMap<u32, ChoiceState>,
    events_seen: usize,
}

impl ChunkAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &ChatCompletionChunk) {
        self.events_seen += 1;
        if self.id.is_none() && !chunk.id.is_empty() {
            self.id = Some(chunk.id.clone());
        }
        if self.model.is_none() && !chunk.model.is_empty() {
            self.model = Some(chunk.model.clone());
        }
        if chunk.created != 0 {
            self.created = chunk.created;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage.clone();
        }
        for choice in &chunk.choices {
            let state = self.choices.entry(choice.index).or_default();
            if let Some(text) = &choice.delta.content {
                state.content.push_str(text);
            }
            if let Some(reason) = choice.finish_reason {
                state.finish_reason = Some(reason);
            }
        }
    }

    /// True once any content or finish reason arrived; used to decide
    /// whether a broken stream still produced an accountable response.
    pub fn has_events(&self) -> bool {
        self.events_seen > 0
    }

    /// Total characters aggregated so far, a cheap proxy for output size.
    pub fn content_len(&self) -> usize {
        self.choices.values().map(|state| state.content.len()).sum()
    }

    pub fn finalize(&self) -> ChatCompletionResponse {
        let choices = if self.choices.is_empty() {
            vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: ChatRole::Assistant,
                    content: String::new(),
                },
                finish_reason: Some(FinishReason::Stop),
            }]
        } else {
            self.choices
                .iter()
                .map(|(index, state)| ChatChoice {
                    index: *index,
                    message: AssistantMessage {
                        role: ChatRole::Assistant,
                        content: state.content.clone(),
                    },
                    // A stream that died mid-flight finalizes as truncated.
                    finish_reason: Some(state.finish_reason.unwrap_or(FinishReason::Length)),
                })
                .collect()
        };
        ChatCompletionResponse {
            id: self.id.clone().unwrap_or_else(|| "chatcmpl".to_string()),
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model.clone().unwrap_or_else(|| "unknown".to_string()),
            choices,
            usage: self.usage.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_deltas_in_order() {
        let mut aggregator = ChunkAggregator::new();
        aggregator.push(&ChatCompletionChunk::delta("c1", "gpt-4o", 5, "Hel".into()));
        aggregator.push(&ChatCompletionChunk::delta("c1", "gpt-4o", 5, "lo".into()));
        aggregator.push(&ChatCompletionChunk::finish(
            "c1",
            "gpt-4o",
            5,
            FinishReason::Stop,
        ));

        let response = aggregator.finalize();
        assert_eq!(response.id, "c1");
        assert_eq!(response.choices[0].message.content, "Hello");
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Stop));
        assert!(aggregator.has_events());
    }

    #[test]
    fn truncated_stream_finalizes_as_length() {
        let mut aggregator = ChunkAggregator::new();
        aggregator.push(&ChatCompletionChunk::delta("c1", "gpt-4o", 5, "part".into()));
        let response = aggregator.finalize();
        assert_eq!(
            response.choices[0].finish_reason,
            Some(FinishReason::Length)
        );
    }

    #[test]
    fn empty_aggregator_produces_empty_completion() {
        let aggregator = ChunkAggregator::new();
        assert!(!aggregator.has_events());
        let response = aggregator.finalize();
        assert_eq!(response.choices.len(), 1);
        assert_eq!(response.choices[0].message.content, "");
    }
}
