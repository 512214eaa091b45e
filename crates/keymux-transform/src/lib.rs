//! Schema translation between the API formats keymux speaks.
//!
//! Streaming goes through a single internal event model, the OpenAI chat
//! chunk: provider adapters normalize upstream events into chunks, output
//! renderers turn chunks into the client's format, and the aggregator folds
//! chunks into a finalized blocking response. That keeps the translation
//! surface at N adapters + M renderers instead of N×M transformers.

pub mod aggregate;
pub mod request;
pub mod response;
pub mod stream;

use keymux_protocol::ApiFormat;

#[derive(Debug, Clone, PartialEq)]
pub enum TransformError {
    /// The (inbound, outbound) pair has no registered transformer.
    UnsupportedPair {
        inbound: ApiFormat,
        outbound: ApiFormat,
    },
    /// Payload failed to parse as the expected schema.
    BadPayload(String),
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformError::UnsupportedPair { inbound, outbound } => {
                write!(f, "no transform from {inbound} to {outbound}")
            }
            TransformError::BadPayload(message) => write!(f, "bad payload: {message}"),
        }
    }
}

impl std::error::Error for TransformError {}

impl From<serde_json::Error> for TransformError {
    fn from(err: serde_json::Error) -> Self {
        TransformError::BadPayload(err.to_string())
    }
}
