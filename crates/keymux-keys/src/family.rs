//! Pure model-name classification: model string → family → owning service.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Service {
    OpenAi,
    Anthropic,
    Aws,
    Gcp,
    Azure,
    GoogleAi,
    Mistral,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::OpenAi => "openai",
            Service::Anthropic => "anthropic",
            Service::Aws => "aws",
            Service::Gcp => "gcp",
            Service::Azure => "azure",
            Service::GoogleAi => "google-ai",
            Service::Mistral => "mistral",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "openai" => Some(Service::OpenAi),
            "anthropic" => Some(Service::Anthropic),
            "aws" => Some(Service::Aws),
            "gcp" => Some(Service::Gcp),
            "azure" => Some(Service::Azure),
            "google-ai" => Some(Service::GoogleAi),
            "mistral" => Some(Service::Mistral),
            _ => None,
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse model class used for queue partitioning and per-key usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
    Turbo,
    Gpt4,
    Gpt4Turbo,
    Gpt4o,
    Dalle,
    Claude,
    ClaudeOpus,
    AwsClaude,
    AwsClaudeOpus,
    AwsMistral,
    GcpClaude,
    AzureTurbo,
    AzureGpt4o,
    AzureDalle,
    GeminiFlash,
    GeminiPro,
    GeminiUltra,
    MistralTiny,
    MistralSmall,
    MistralMedium,
    MistralLarge,
}

impl ModelFamily {
    pub const ALL: &'static [ModelFamily] = &[
        ModelFamily::Turbo,
        ModelFamily::Gpt4,
        ModelFamily::Gpt4Turbo,
        ModelFamily::Gpt4o,
        ModelFamily::Dalle,
        ModelFamily::Claude,
        ModelFamily::ClaudeOpus,
        ModelFamily::AwsClaude,
        ModelFamily::AwsClaudeOpus,
        ModelFamily::AwsMistral,
        ModelFamily::GcpClaude,
        ModelFamily::AzureTurbo,
        ModelFamily::AzureGpt4o,
        ModelFamily::AzureDalle,
        ModelFamily::GeminiFlash,
        ModelFamily::GeminiPro,
        ModelFamily::GeminiUltra,
        ModelFamily::MistralTiny,
        ModelFamily::MistralSmall,
        ModelFamily::MistralMedium,
        ModelFamily::MistralLarge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Turbo => "turbo",
            ModelFamily::Gpt4 => "gpt4",
            ModelFamily::Gpt4Turbo => "gpt4-turbo",
            ModelFamily::Gpt4o => "gpt4o",
            ModelFamily::Dalle => "dall-e",
            ModelFamily::Claude => "claude",
            ModelFamily::ClaudeOpus => "claude-opus",
            ModelFamily::AwsClaude => "aws-claude",
            ModelFamily::AwsClaudeOpus => "aws-claude-opus",
            ModelFamily::AwsMistral => "aws-mistral",
            ModelFamily::GcpClaude => "gcp-claude",
            ModelFamily::AzureTurbo => "azure-turbo",
            ModelFamily::AzureGpt4o => "azure-gpt4o",
            ModelFamily::AzureDalle => "azure-dall-e",
            ModelFamily::GeminiFlash => "gemini-flash",
            ModelFamily::GeminiPro => "gemini-pro",
            ModelFamily::GeminiUltra => "gemini-ultra",
            ModelFamily::MistralTiny => "mistral-tiny",
            ModelFamily::MistralSmall => "mistral-small",
            ModelFamily::MistralMedium => "mistral-medium",
            ModelFamily::MistralLarge => "mistral-large",
        }
    }

    pub fn service(&self) -> Service {
        match self {
            ModelFamily::Turbo
            | ModelFamily::Gpt4
            | ModelFamily::Gpt4Turbo
            | ModelFamily::Gpt4o
            | ModelFamily::Dalle => Service::OpenAi,
            ModelFamily::Claude | ModelFamily::ClaudeOpus => Service::Anthropic,
            ModelFamily::AwsClaude | ModelFamily::AwsClaudeOpus | ModelFamily::AwsMistral => {
                Service::Aws
            }
            ModelFamily::GcpClaude => Service::Gcp,
            ModelFamily::AzureTurbo | ModelFamily::AzureGpt4o | ModelFamily::AzureDalle => {
                Service::Azure
            }
            ModelFamily::GeminiFlash | ModelFamily::GeminiPro | ModelFamily::GeminiUltra => {
                Service::GoogleAi
            }
            ModelFamily::MistralTiny
            | ModelFamily::MistralSmall
            | ModelFamily::MistralMedium
            | ModelFamily::MistralLarge => Service::Mistral,
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.as_str() == tag)
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic model → family table. Order matters: more specific
/// prefixes are tested first.
pub fn family_of(model: &str) -> Option<ModelFamily> {
    // Bedrock/Vertex model IDs carry their own namespaces.
    if let Some(rest) = model.strip_prefix("anthropic.") {
        if rest.starts_with("claude-3-opus") {
            return Some(ModelFamily::AwsClaudeOpus);
        }
        if rest.starts_with("claude") {
            return Some(ModelFamily::AwsClaude);
        }
        return None;
    }
    if model.starts_with("mistral.") {
        return Some(ModelFamily::AwsMistral);
    }
    if let Some(rest) = model.strip_prefix("gcp/") {
        return rest.starts_with("claude").then_some(ModelFamily::GcpClaude);
    }
    if let Some(rest) = model.strip_prefix("azure/") {
        if rest.starts_with("gpt-4o") {
            return Some(ModelFamily::AzureGpt4o);
        }
        if rest.starts_with("gpt-3.5") || rest.starts_with("gpt-35") {
            return Some(ModelFamily::AzureTurbo);
        }
        if rest.starts_with("dall-e") {
            return Some(ModelFamily::AzureDalle);
        }
        return None;
    }

    if model.starts_with("gpt-4o") || model.starts_with("chatgpt-4o") {
        return Some(ModelFamily::Gpt4o);
    }
    if model.starts_with("gpt-4-turbo") || model.starts_with("gpt-4-1106")
        || model.starts_with("gpt-4-0125")
    {
        return Some(ModelFamily::Gpt4Turbo);
    }
    if model.starts_with("gpt-4") {
        return Some(ModelFamily::Gpt4);
    }
    if model.starts_with("gpt-3.5") || model.starts_with("text-davinci") {
        return Some(ModelFamily::Turbo);
    }
    if model.starts_with("dall-e") {
        return Some(ModelFamily::Dalle);
    }
    if model.starts_with("claude-3-opus") || model.starts_with("claude-opus") {
        return Some(ModelFamily::ClaudeOpus);
    }
    if model.starts_with("claude") {
        return Some(ModelFamily::Claude);
    }
    if model.starts_with("gemini") {
        if model.contains("flash") {
            return Some(ModelFamily::GeminiFlash);
        }
        if model.contains("ultra") {
            return Some(ModelFamily::GeminiUltra);
        }
        return Some(ModelFamily::GeminiPro);
    }
    if model.starts_with("mistral-tiny") || model.starts_with("open-mistral-7b") {
        return Some(ModelFamily::MistralTiny);
    }
    if model.starts_with("mistral-small") || model.starts_with("open-mixtral") {
        return Some(ModelFamily::MistralSmall);
    }
    if model.starts_with("mistral-medium") {
        return Some(ModelFamily::MistralMedium);
    }
    if model.starts_with("mistral-large") {
        return Some(ModelFamily::MistralLarge);
    }
    None
}

/// Service owning a model string, derived from the family table.
pub fn service_of(model: &str) -> Option<Service> {
    family_of(model).map(|family| family.service())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_namespace_prefix() {
        assert_eq!(family_of("gpt-4o-2024-05-13"), Some(ModelFamily::Gpt4o));
        assert_eq!(
            family_of("anthropic.claude-3-5-sonnet-20240620-v1:0"),
            Some(ModelFamily::AwsClaude)
        );
        assert_eq!(
            family_of("anthropic.claude-3-opus-20240229-v1:0"),
            Some(ModelFamily::AwsClaudeOpus)
        );
        assert_eq!(family_of("claude-3-opus-20240229"), Some(ModelFamily::ClaudeOpus));
        assert_eq!(family_of("gcp/claude-3-haiku"), Some(ModelFamily::GcpClaude));
        assert_eq!(family_of("gemini-1.5-flash"), Some(ModelFamily::GeminiFlash));
        assert_eq!(family_of("mistral-large-2402"), Some(ModelFamily::MistralLarge));
        assert_eq!(family_of("made-up-model"), None);
    }

    #[test]
    fn families_map_to_their_service() {
        assert_eq!(service_of("gpt-3.5-turbo"), Some(Service::OpenAi));
        assert_eq!(service_of("claude-3-5-sonnet-20240620"), Some(Service::Anthropic));
        assert_eq!(service_of("mistral.mistral-7b-instruct-v0:2"), Some(Service::Aws));
        assert_eq!(service_of("azure/gpt-4o"), Some(Service::Azure));
    }
}
