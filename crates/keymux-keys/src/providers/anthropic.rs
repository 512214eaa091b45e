//! Anthropic key provider: preamble and multimodality discovery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::checker::{
    CheckerConfig, CheckerHandle, KeyProbe, ProbeClient, ProbeOutcome, ProbeRequest, family_set,
    spawn_checker,
};
use crate::events::EventHub;
use crate::family::{ModelFamily, Service, family_of};
use crate::key::{AnthropicTier, Key, KeyDetail, KeyPatch};
use crate::provider::{KeyProvider, split_config_keys};
use crate::ring::{KeyPoolError, KeyRing};

const KEY_REUSE_DELAY: Duration = Duration::from_millis(500);
const RATE_LIMIT_LOCKOUT: Duration = Duration::from_millis(2000);
const API_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const PROBE_MODEL: &str = "claude-3-5-sonnet-20240620";

pub struct AnthropicKeyProvider {
    ring: Arc<KeyRing>,
    checker: Option<CheckerHandle>,
}

impl AnthropicKeyProvider {
    pub fn from_config(
        raw: &str,
        events: EventHub,
        probe_client: Option<Arc<dyn ProbeClient>>,
    ) -> Self {
        let keys = split_config_keys(raw)
            .into_iter()
            .map(|secret| {
                Key::new(
                    Service::Anthropic,
                    secret,
                    [ModelFamily::Claude, ModelFamily::ClaudeOpus],
                    default_detail(),
                )
            })
            .collect();
        let ring = KeyRing::new(
            Service::Anthropic,
            KEY_REUSE_DELAY,
            RATE_LIMIT_LOCKOUT,
            keys,
            events,
        );
        let checker = probe_client.map(|client| {
            spawn_checker(
                ring.clone(),
                Arc::new(AnthropicProbe),
                client,
                CheckerConfig {
                    min_check_interval: Duration::from_secs(60 * 60),
                    batch_size: 4,
                    recurring: true,
                },
            )
        });
        Self { ring, checker }
    }
}

#[async_trait]
impl KeyProvider for AnthropicKeyProvider {
    fn service(&self) -> Service {
        Service::Anthropic
    }

    fn ring(&self) -> &Arc<KeyRing> {
        &self.ring
    }

    async fn get(&self, model: &str) -> Result<Key, KeyPoolError> {
        let family =
            family_of(model).ok_or_else(|| KeyPoolError::UnknownModel(model.to_string()))?;
        self.ring
            .acquire(
                family,
                |key| match &key.detail {
                    KeyDetail::Anthropic { is_over_quota, .. } => !is_over_quota,
                    _ => false,
                },
                None,
            )
            .await
    }

    fn wake_checker(&self) {
        if let Some(checker) = &self.checker {
            checker.wake();
        }
    }
}

fn default_detail() -> KeyDetail {
    KeyDetail::Anthropic {
        tier: AnthropicTier::Unknown,
        is_pozzed: false,
        is_over_quota: false,
        requires_preamble: false,
        allows_multimodality: true,
    }
}

struct AnthropicProbe;

#[derive(Deserialize)]
struct ErrorPage {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[async_trait]
impl KeyProbe for AnthropicProbe {
    async fn probe(&self, client: &dyn ProbeClient, key: &Key) -> ProbeOutcome {
        // Minimal message probe: validity, quota state, multimodality.
        let messages = match client
            .send(
                ProbeRequest::post(
                    format!("{API_BASE}/v1/messages"),
                    serde_json::to_vec(&serde_json::json!({
                        "model": PROBE_MODEL,
                        "max_tokens": 1,
                        "messages": [{"role": "user", "content": [
                            {"type": "text", "text": "hi"},
                            {"type": "image", "source": {
                                "type": "base64",
                                "media_type": "image/png",
                                "data": PIXEL_PNG_B64
                            }}
                        ]}]
                    }))
                    .unwrap_or_default(),
                )
                .header("x-api-key", key.secret.clone())
                .header("anthropic-version", API_VERSION),
            )
            .await
        {
            Ok(response) => response,
            Err(message) => return ProbeOutcome::Network(message),
        };

        let mut allows_multimodality = true;
        match messages.status {
            200 => {}
            400 => {
                let body = messages.body_text();
                if body.contains("image") || body.contains("multimodal") {
                    allows_multimodality = false;
                } else if let Ok(page) = serde_json::from_slice::<ErrorPage>(&messages.body) {
                    return classify_error(messages.status, &page.error);
                }
            }
            401 | 403 => return ProbeOutcome::Invalid,
            429 => {
                // Distinguish probe throttling from exhausted quota.
                if let Ok(page) = serde_json::from_slice::<ErrorPage>(&messages.body) {
                    return classify_error(messages.status, &page.error);
                }
                return ProbeOutcome::RateLimited;
            }
            status => return ProbeOutcome::Unknown(status, messages.body_text()),
        }

        // Legacy completion without the Human preamble: some keys reject it.
        let requires_preamble = match client
            .send(
                ProbeRequest::post(
                    format!("{API_BASE}/v1/complete"),
                    serde_json::to_vec(&serde_json::json!({
                        "model": "claude-2.1",
                        "max_tokens_to_sample": 1,
                        "prompt": "Hi\n\nAssistant:"
                    }))
                    .unwrap_or_default(),
                )
                .header("x-api-key", key.secret.clone())
                .header("anthropic-version", API_VERSION),
            )
            .await
        {
            Ok(response) if response.status == 400 => {
                response.body_text().contains("Human:")
            }
            _ => false,
        };

        let prior = match &key.detail {
            KeyDetail::Anthropic { tier, is_pozzed, .. } => (*tier, *is_pozzed),
            _ => (AnthropicTier::Unknown, false),
        };
        ProbeOutcome::Healthy(KeyPatch {
            model_families: Some(family_set([ModelFamily::Claude, ModelFamily::ClaudeOpus])),
            detail: Some(KeyDetail::Anthropic {
                tier: prior.0,
                is_pozzed: prior.1,
                is_over_quota: false,
                requires_preamble,
                allows_multimodality,
            }),
            ..Default::default()
        })
    }
}

fn classify_error(status: u16, error: &ErrorDetail) -> ProbeOutcome {
    let kind = error.kind.as_deref().unwrap_or("");
    let message = error.message.as_deref().unwrap_or("");
    match kind {
        "authentication_error" => ProbeOutcome::Invalid,
        "permission_error" => ProbeOutcome::Invalid,
        "rate_limit_error" => {
            if message.contains("credit") || message.contains("quota") {
                ProbeOutcome::OverQuota
            } else {
                ProbeOutcome::RateLimited
            }
        }
        "billing_error" => ProbeOutcome::OverQuota,
        _ => ProbeOutcome::Unknown(status, format!("{kind}: {message}")),
    }
}

// 1x1 transparent PNG.
const PIXEL_PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";
