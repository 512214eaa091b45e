//! Azure OpenAI key provider. Secrets are `resourceName:deploymentId:apiKey`
//! composites; each credential addresses exactly one deployment.

use std::collections::BTreeSet;
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
use crate::key::{Key, KeyDetail, KeyPatch};
use crate::provider::{KeyProvider, split_config_keys};
use crate::ring::{KeyPoolError, KeyRing};

const KEY_REUSE_DELAY: Duration = Duration::from_millis(500);
const RATE_LIMIT_LOCKOUT: Duration = Duration::from_millis(4000);
pub const API_VERSION: &str = "2024-02-01";

#[derive(Debug, Clone)]
pub struct AzureCredentialParts {
    pub resource_name: String,
    pub deployment_id: String,
    pub api_key: String,
}

pub fn parse_azure_secret(secret: &str) -> Option<AzureCredentialParts> {
    let mut parts = secret.splitn(3, ':');
    let resource_name = parts.next()?.trim();
    let deployment_id = parts.next()?.trim();
    let api_key = parts.next()?.trim();
    if resource_name.is_empty() || deployment_id.is_empty() || api_key.is_empty() {
        return None;
    }
    Some(AzureCredentialParts {
        resource_name: resource_name.to_string(),
        deployment_id: deployment_id.to_string(),
        api_key: api_key.to_string(),
    })
}

pub struct AzureKeyProvider {
    ring: Arc<KeyRing>,
    checker: Option<CheckerHandle>,
}

impl AzureKeyProvider {
    pub fn from_config(
        raw: &str,
        events: EventHub,
        probe_client: Option<Arc<dyn ProbeClient>>,
    ) -> Self {
        let keys = split_config_keys(raw)
            .into_iter()
            .filter_map(|secret| {
                let parts = parse_azure_secret(&secret)?;
                let family = family_for_deployment(&parts.deployment_id);
                Some(Key::new(
                    Service::Azure,
                    secret,
                    [family],
                    KeyDetail::Azure {
                        resource_name: parts.resource_name,
                        deployment_id: parts.deployment_id,
                        content_filtering: false,
                        model_ids: BTreeSet::new(),
                    },
                ))
            })
            .collect();
        let ring = KeyRing::new(
            Service::Azure,
            KEY_REUSE_DELAY,
            RATE_LIMIT_LOCKOUT,
            keys,
            events,
        );
        // One-shot validation pass; Azure is not re-probed.
        let checker = probe_client.map(|client| {
            spawn_checker(
                ring.clone(),
                Arc::new(AzureProbe),
                client,
                CheckerConfig {
                    batch_size: 4,
                    recurring: false,
                    ..Default::default()
                },
            )
        });
        Self { ring, checker }
    }
}

/// Deployment names usually embed the model name; fall back to gpt-4o.
fn family_for_deployment(deployment_id: &str) -> ModelFamily {
    let lowered = deployment_id.to_ascii_lowercase();
    if lowered.contains("dall") {
        ModelFamily::AzureDalle
    } else if lowered.contains("gpt-35") || lowered.contains("gpt-3.5") || lowered.contains("turbo")
    {
        ModelFamily::AzureTurbo
    } else {
        ModelFamily::AzureGpt4o
    }
}

#[async_trait]
impl KeyProvider for AzureKeyProvider {
    fn service(&self) -> Service {
        Service::Azure
    }

    fn ring(&self) -> &Arc<KeyRing> {
        &self.ring
    }

    async fn get(&self, model: &str) -> Result<Key, KeyPoolError> {
        let family =
            family_of(model).ok_or_else(|| KeyPoolError::UnknownModel(model.to_string()))?;
        self.ring.acquire(family, |_| true, None).await
    }

    fn wake_checker(&self) {
        if let Some(checker) = &self.checker {
            checker.wake();
        }
    }
}

struct AzureProbe;

#[derive(Deserialize)]
struct ChatProbeResponse {
    #[serde(default)]
    model: Option<String>,
}

#[async_trait]
impl KeyProbe for AzureProbe {
    async fn probe(&self, client: &dyn ProbeClient, key: &Key) -> ProbeOutcome {
        let Some(parts) = parse_azure_secret(&key.secret) else {
            return ProbeOutcome::Invalid;
        };
        let url = format!(
            "https://{}.openai.azure.com/openai/deployments/{}/chat/completions?api-version={}",
            parts.resource_name, parts.deployment_id, API_VERSION
        );
        let response = match client
            .send(
                ProbeRequest::post(
                    url,
                    br#"{"messages":[{"role":"user","content":"hi"}],"max_tokens":1}"#.to_vec(),
                )
                .header("api-key", parts.api_key.clone()),
            )
            .await
        {
            Ok(response) => response,
            Err(message) => return ProbeOutcome::Network(message),
        };

        match response.status {
            200 => {
                let model_ids = serde_json::from_slice::<ChatProbeResponse>(&response.body)
                    .ok()
                    .and_then(|body| body.model)
                    .into_iter()
                    .collect::<BTreeSet<String>>();
                ProbeOutcome::Healthy(KeyPatch {
                    model_families: Some(family_set([family_for_deployment(
                        &parts.deployment_id,
                    )])),
                    detail: Some(KeyDetail::Azure {
                        resource_name: parts.resource_name,
                        deployment_id: parts.deployment_id,
                        content_filtering: false,
                        model_ids,
                    }),
                    ..Default::default()
                })
            }
            400 if response.body_text().contains("content_filter") => {
                ProbeOutcome::Healthy(KeyPatch {
                    detail: Some(KeyDetail::Azure {
                        resource_name: parts.resource_name,
                        deployment_id: parts.deployment_id,
                        content_filtering: true,
                        model_ids: BTreeSet::new(),
                    }),
                    ..Default::default()
                })
            }
            401 | 403 => ProbeOutcome::Invalid,
            404 => ProbeOutcome::Invalid,
            429 => ProbeOutcome::RateLimited,
            status => ProbeOutcome::Unknown(status, response.body_text()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_name_drives_family() {
        assert_eq!(family_for_deployment("my-gpt-4o"), ModelFamily::AzureGpt4o);
        assert_eq!(family_for_deployment("gpt-35-turbo"), ModelFamily::AzureTurbo);
        assert_eq!(family_for_deployment("dalle3"), ModelFamily::AzureDalle);
    }

    #[test]
    fn composite_secret_parses() {
        let parts = parse_azure_secret("res:dep:key123").unwrap();
        assert_eq!(parts.resource_name, "res");
        assert_eq!(parts.deployment_id, "dep");
        assert_eq!(parts.api_key, "key123");
    }
}
