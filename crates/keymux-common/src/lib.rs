use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("invalid config value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

/// Final, merged process configuration.
///
/// Merge order: CLI > ENV > defaults. The snapshot is immutable once built;
/// the running process holds it behind an `ArcSwap`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    /// Comma-separated credential strings, keyed by provider tag
    /// ("openai", "anthropic", "aws", "gcp", "azure", "google-ai", "mistral").
    pub credentials: HashMap<String, String>,
    /// Origin/Referer substrings that are rejected before enqueue.
    pub blocked_origins: Vec<String>,
    /// Per-family token quota applied per user token. Empty map disables quotas.
    pub token_quotas: HashMap<String, u64>,
    /// Hard cap on prompt + requested output tokens per request.
    pub max_context_tokens: u64,
    /// Maximum queued requests per queue identity.
    pub user_concurrency_limit: usize,
    /// Queue length above which non-streaming requests are rejected.
    pub load_threshold: usize,
    /// When false, AWS keys with logging enabled are ineligible for selection.
    pub allow_aws_logging: bool,
    /// Reject requests carrying image parts when false.
    pub allow_vision: bool,
    /// Optional outbound proxy URL for upstream egress.
    pub proxy: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7860,
            credentials: HashMap::new(),
            blocked_origins: Vec::new(),
            token_quotas: HashMap::new(),
            max_context_tokens: 32_768,
            user_concurrency_limit: 1,
            load_threshold: 50,
            allow_aws_logging: false,
            allow_vision: true,
            proxy: None,
        }
    }
}

/// Optional layer used while merging configuration sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub credentials: HashMap<String, String>,
    pub blocked_origins: Option<Vec<String>>,
    pub token_quotas: Option<HashMap<String, u64>>,
    pub max_context_tokens: Option<u64>,
    pub user_concurrency_limit: Option<usize>,
    pub load_threshold: Option<usize>,
    pub allow_aws_logging: Option<bool>,
    pub allow_vision: Option<bool>,
    pub proxy: Option<String>,
}

impl ProxyConfigPatch {
    pub fn overlay(&mut self, other: ProxyConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        for (provider, keys) in other.credentials {
            self.credentials.insert(provider, keys);
        }
        if other.blocked_origins.is_some() {
            self.blocked_origins = other.blocked_origins;
        }
        if other.token_quotas.is_some() {
            self.token_quotas = other.token_quotas;
        }
        if other.max_context_tokens.is_some() {
            self.max_context_tokens = other.max_context_tokens;
        }
        if other.user_concurrency_limit.is_some() {
            self.user_concurrency_limit = other.user_concurrency_limit;
        }
        if other.load_threshold.is_some() {
            self.load_threshold = other.load_threshold;
        }
        if other.allow_aws_logging.is_some() {
            self.allow_aws_logging = other.allow_aws_logging;
        }
        if other.allow_vision.is_some() {
            self.allow_vision = other.allow_vision;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
    }

    pub fn into_config(self) -> Result<ProxyConfig, ConfigError> {
        let defaults = ProxyConfig::default();
        let port = self.port.unwrap_or(defaults.port);
        if port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port",
                message: "port must be non-zero".to_string(),
            });
        }
        Ok(ProxyConfig {
            host: self.host.unwrap_or(defaults.host),
            port,
            credentials: self.credentials,
            blocked_origins: self.blocked_origins.unwrap_or(defaults.blocked_origins),
            token_quotas: self.token_quotas.unwrap_or(defaults.token_quotas),
            max_context_tokens: self
                .max_context_tokens
                .unwrap_or(defaults.max_context_tokens),
            user_concurrency_limit: self
                .user_concurrency_limit
                .unwrap_or(defaults.user_concurrency_limit),
            load_threshold: self.load_threshold.unwrap_or(defaults.load_threshold),
            allow_aws_logging: self.allow_aws_logging.unwrap_or(defaults.allow_aws_logging),
            allow_vision: self.allow_vision.unwrap_or(defaults.allow_vision),
            proxy: self.proxy,
        })
    }
}

impl From<ProxyConfig> for ProxyConfigPatch {
    fn from(value: ProxyConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            credentials: value.credentials,
            blocked_origins: Some(value.blocked_origins),
            token_quotas: Some(value.token_quotas),
            max_context_tokens: Some(value.max_context_tokens),
            user_concurrency_limit: Some(value.user_concurrency_limit),
            load_threshold: Some(value.load_threshold),
            allow_aws_logging: Some(value.allow_aws_logging),
            allow_vision: Some(value.allow_vision),
            proxy: value.proxy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_later_layer() {
        let mut base = ProxyConfigPatch {
            port: Some(7860),
            ..Default::default()
        };
        base.overlay(ProxyConfigPatch {
            port: Some(9090),
            proxy: Some("http://127.0.0.1:1080".to_string()),
            ..Default::default()
        });
        let config = base.into_config().unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.proxy.as_deref(), Some("http://127.0.0.1:1080"));
    }

    #[test]
    fn zero_port_is_rejected() {
        let patch = ProxyConfigPatch {
            port: Some(0),
            ..Default::default()
        };
        assert!(patch.into_config().is_err());
    }
}
