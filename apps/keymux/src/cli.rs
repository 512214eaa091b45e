use std::collections::HashMap;

use clap::Parser;
use keymux_common::{ProxyConfig, ProxyConfigPatch};

#[derive(Parser)]
#[command(name = "keymux")]
pub(crate) struct Cli {
    #[arg(long, default_value = "0.0.0.0")]
    pub(crate) host: String,
    #[arg(long, default_value_t = 7860)]
    pub(crate) port: u16,
    /// Outbound proxy URL for upstream egress.
    #[arg(long)]
    pub(crate) proxy: Option<String>,
    /// Comma-separated Origin/Referer substrings to reject.
    #[arg(long, default_value = "")]
    pub(crate) blocked_origins: String,
    #[arg(long, default_value_t = 1)]
    pub(crate) user_concurrency_limit: usize,
    #[arg(long, default_value_t = 50)]
    pub(crate) load_threshold: usize,
    #[arg(long, default_value_t = 32768)]
    pub(crate) max_context_tokens: u64,
    #[arg(long, default_value_t = false)]
    pub(crate) allow_aws_logging: bool,
    #[arg(long, default_value_t = true)]
    pub(crate) allow_vision: bool,
}

/// Env var names carrying each provider's comma-separated credential list.
const CREDENTIAL_VARS: &[(&str, &str)] = &[
    ("openai", "OPENAI_KEYS"),
    ("anthropic", "ANTHROPIC_KEYS"),
    ("aws", "AWS_CREDENTIALS"),
    ("gcp", "GCP_CREDENTIALS"),
    ("azure", "AZURE_CREDENTIALS"),
    ("google-ai", "GOOGLE_AI_KEYS"),
    ("mistral", "MISTRAL_KEYS"),
];

/// CLI over env over defaults.
pub(crate) fn build_config(cli: Cli) -> Result<ProxyConfig, keymux_common::ConfigError> {
    let mut credentials = HashMap::new();
    for (tag, var) in CREDENTIAL_VARS {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                credentials.insert(tag.to_string(), value);
            }
        }
    }

    let mut merged = ProxyConfigPatch {
        credentials,
        ..Default::default()
    };
    merged.overlay(ProxyConfigPatch {
        host: Some(cli.host),
        port: Some(cli.port),
        proxy: cli.proxy,
        blocked_origins: Some(
            cli.blocked_origins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        user_concurrency_limit: Some(cli.user_concurrency_limit),
        load_threshold: Some(cli.load_threshold),
        max_context_tokens: Some(cli.max_context_tokens),
        allow_aws_logging: Some(cli.allow_aws_logging),
        allow_vision: Some(cli.allow_vision),
        ..Default::default()
    });
    merged.into_config()
}
