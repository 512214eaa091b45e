//! Incremental server-sent-events decoding and encoding.

use bytes::Bytes;

pub const DONE_DATA: &str = "[DONE]";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_DATA
    }

    /// Wire encoding, terminated by the blank separator line.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Encodes an SSE comment line (used for queue join/heartbeat traffic).
pub fn encode_comment(text: &str) -> String {
    format!(": {text}\n\n")
}

/// Streaming decoder: feed arbitrary byte chunks, get completed events.
///
/// Carries partial lines and partial events across `feed` calls. Comment
/// lines are dropped; a trailing unterminated event can be recovered with
/// `finish`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    partial: String,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        self.feed_str(text)
    }

    pub fn feed_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.partial.push_str(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            self.consume_line(line, &mut events);
        }

        events
    }

    /// Flush any buffered line/event at end of stream.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            let line = line.trim_end_matches('\r').to_string();
            self.consume_line(&line, &mut events);
        }
        self.flush_event(&mut events);
        events
    }

    fn consume_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.flush_event(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.event_name = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
    }

    fn flush_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event_name.is_none() && self.data_lines.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: self.event_name.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_events_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed_str("data: {\"a\":").is_empty());
        assert!(decoder.feed_str("1}\n").is_empty());
        let events = decoder.feed_str("\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[1].is_done());
    }

    #[test]
    fn named_events_and_comments() {
        let mut decoder = SseDecoder::new();
        let events =
            decoder.feed_str(": heartbeat\nevent: message_stop\ndata: {}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_stop"));
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn multi_line_data_joined_with_newline() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed_str("data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn finish_recovers_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed_str("data: tail").is_empty());
        let events = decoder.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn encode_round_trips() {
        let event = SseEvent::named("ping", "{}");
        let mut decoder = SseDecoder::new();
        let decoded = decoder.feed_str(&event.encode());
        assert_eq!(decoded, vec![event]);
    }
}
