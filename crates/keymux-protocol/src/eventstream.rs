//! Incremental decoder for the `application/vnd.amazon.eventstream` framing
//! Bedrock uses for streaming invocations.
//!
//! Frame layout: 4-byte total length, 4-byte headers length, 4-byte prelude
//! CRC, headers, payload, 4-byte message CRC (big-endian throughout). Headers
//! are (name-len u8, name, value-type u8, value). Only string headers are
//! surfaced; everything else is skipped structurally. CRCs are not verified:
//! the proxy re-frames the payload as SSE and a corrupt frame surfaces as a
//! JSON parse failure downstream anyway.

use bytes::{Buf, Bytes, BytesMut};

pub const PRELUDE_LEN: usize = 12;
pub const CRC_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct EventStreamFrame {
    pub message_type: Option<String>,
    pub event_type: Option<String>,
    pub exception_type: Option<String>,
    pub payload: Bytes,
}

impl EventStreamFrame {
    pub fn is_exception(&self) -> bool {
        self.exception_type.is_some()
            || self.message_type.as_deref() == Some("exception")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame declared a length the prelude cannot satisfy.
    BadFrameLength,
    /// Header block was truncated or malformed.
    BadHeaderBlock,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::BadFrameLength => write!(f, "event-stream frame length invalid"),
            DecodeError::BadHeaderBlock => write!(f, "event-stream header block malformed"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: BytesMut,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<EventStreamFrame>, DecodeError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn next_frame(&mut self) -> Result<Option<EventStreamFrame>, DecodeError> {
        if self.buffer.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let total_len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        let headers_len = u32::from_be_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ]) as usize;

        if total_len < PRELUDE_LEN + CRC_LEN || headers_len > total_len - PRELUDE_LEN - CRC_LEN {
            return Err(DecodeError::BadFrameLength);
        }
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(total_len);
        frame.advance(PRELUDE_LEN);
        let headers = frame.split_to(headers_len);
        let payload_len = total_len - PRELUDE_LEN - headers_len - CRC_LEN;
        let payload = frame.split_to(payload_len).freeze();

        let mut out = EventStreamFrame {
            message_type: None,
            event_type: None,
            exception_type: None,
            payload,
        };
        parse_headers(&headers, &mut out)?;
        Ok(Some(out))
    }
}

fn parse_headers(mut block: &[u8], frame: &mut EventStreamFrame) -> Result<(), DecodeError> {
    while !block.is_empty() {
        let name_len = block[0] as usize;
        block = &block[1..];
        if block.len() < name_len + 1 {
            return Err(DecodeError::BadHeaderBlock);
        }
        let name = std::str::from_utf8(&block[..name_len])
            .map_err(|_| DecodeError::BadHeaderBlock)?
            .to_string();
        block = &block[name_len..];
        let value_type = block[0];
        block = &block[1..];

        let string_value = match value_type {
            // bool true / bool false carry no value bytes
            0 | 1 => None,
            2 => {
                block = skip(block, 1)?;
                None
            }
            3 => {
                block = skip(block, 2)?;
                None
            }
            4 => {
                block = skip(block, 4)?;
                None
            }
            5 | 8 => {
                block = skip(block, 8)?;
                None
            }
            6 | 7 => {
                if block.len() < 2 {
                    return Err(DecodeError::BadHeaderBlock);
                }
                let len = u16::from_be_bytes([block[0], block[1]]) as usize;
                block = &block[2..];
                if block.len() < len {
                    return Err(DecodeError::BadHeaderBlock);
                }
                let value = (value_type == 7)
                    .then(|| std::str::from_utf8(&block[..len]).ok())
                    .flatten()
                    .map(|s| s.to_string());
                block = &block[len..];
                value
            }
            9 => {
                block = skip(block, 16)?;
                None
            }
            _ => return Err(DecodeError::BadHeaderBlock),
        };

        if let Some(value) = string_value {
            match name.as_str() {
                ":message-type" => frame.message_type = Some(value),
                ":event-type" => frame.event_type = Some(value),
                ":exception-type" => frame.exception_type = Some(value),
                _ => {}
            }
        }
    }
    Ok(())
}

fn skip(block: &[u8], n: usize) -> Result<&[u8], DecodeError> {
    if block.len() < n {
        return Err(DecodeError::BadHeaderBlock);
    }
    Ok(&block[n..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_header(name: &str, value: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.push(7u8);
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
        out
    }

    fn frame(headers: &[u8], payload: &[u8]) -> Vec<u8> {
        let total = PRELUDE_LEN + headers.len() + payload.len() + CRC_LEN;
        let mut out = Vec::new();
        out.extend_from_slice(&(total as u32).to_be_bytes());
        out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(headers);
        out.extend_from_slice(payload);
        out.extend_from_slice(&[0u8; 4]);
        out
    }

    #[test]
    fn decodes_frame_split_across_feeds() {
        let mut headers = string_header(":message-type", "event");
        headers.extend(string_header(":event-type", "chunk"));
        let encoded = frame(&headers, br#"{"bytes":"e30="}"#);

        let mut decoder = EventStreamDecoder::new();
        let (left, right) = encoded.split_at(7);
        assert!(decoder.feed(left).unwrap().is_empty());
        let frames = decoder.feed(right).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type.as_deref(), Some("chunk"));
        assert!(!frames[0].is_exception());
        assert_eq!(&frames[0].payload[..], br#"{"bytes":"e30="}"#);
    }

    #[test]
    fn exception_frames_are_flagged() {
        let mut headers = string_header(":message-type", "exception");
        headers.extend(string_header(":exception-type", "throttlingException"));
        let encoded = frame(&headers, br#"{"message":"slow down"}"#);

        let mut decoder = EventStreamDecoder::new();
        let frames = decoder.feed(&encoded).unwrap();
        assert!(frames[0].is_exception());
        assert_eq!(
            frames[0].exception_type.as_deref(),
            Some("throttlingException")
        );
    }

    #[test]
    fn bogus_length_is_an_error() {
        let mut decoder = EventStreamDecoder::new();
        let bad = [0u8, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(decoder.feed(&bad), Err(DecodeError::BadFrameLength));
    }
}
