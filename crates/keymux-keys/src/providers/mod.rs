//! Concrete per-provider key providers.

pub mod anthropic;
pub mod aws;
pub mod azure;
pub mod gcp;
pub mod googleai;
pub mod mistral;
pub mod openai;

pub use anthropic::AnthropicKeyProvider;
pub use aws::AwsKeyProvider;
pub use azure::AzureKeyProvider;
pub use gcp::GcpKeyProvider;
pub use googleai::GoogleAiKeyProvider;
pub use mistral::MistralKeyProvider;
pub use openai::OpenAiKeyProvider;
