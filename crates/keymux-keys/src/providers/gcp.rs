//! GCP Vertex key provider.
//!
//! Secrets are `projectId:clientEmail:region:base64Pkcs8PrivateKey`
//! composites (PEM markers stripped, no embedded newlines). The first check
//! probes every Claude variant in parallel and records per-variant flags.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::checker::{
    CheckerConfig, CheckerHandle, KeyProbe, ProbeAuth, ProbeClient, ProbeOutcome, ProbeRequest,
    family_set, spawn_checker,
};
use crate::events::EventHub;
use crate::family::{ModelFamily, Service, family_of};
use crate::key::{Key, KeyDetail, KeyPatch};
use crate::provider::{KeyProvider, split_config_keys};
use crate::ring::{KeyPoolError, KeyRing};

const KEY_REUSE_DELAY: Duration = Duration::from_millis(500);
const RATE_LIMIT_LOCKOUT: Duration = Duration::from_millis(4000);

const SONNET_ID: &str = "claude-3-sonnet@20240229";
const SONNET35_ID: &str = "claude-3-5-sonnet@20240620";
const HAIKU_ID: &str = "claude-3-haiku@20240307";

#[derive(Debug, Clone)]
pub struct GcpCredentialParts {
    pub project_id: String,
    pub client_email: String,
    pub region: String,
    pub private_key_b64: String,
}

pub fn parse_gcp_secret(secret: &str) -> Option<GcpCredentialParts> {
    let mut parts = secret.splitn(4, ':');
    let project_id = parts.next()?.trim();
    let client_email = parts.next()?.trim();
    let region = parts.next()?.trim();
    let private_key_b64 = parts.next()?.trim();
    if project_id.is_empty()
        || client_email.is_empty()
        || region.is_empty()
        || private_key_b64.is_empty()
    {
        return None;
    }
    Some(GcpCredentialParts {
        project_id: project_id.to_string(),
        client_email: client_email.to_string(),
        region: region.to_string(),
        private_key_b64: private_key_b64.to_string(),
    })
}

pub struct GcpKeyProvider {
    ring: Arc<KeyRing>,
    checker: Option<CheckerHandle>,
}

impl GcpKeyProvider {
    pub fn from_config(
        raw: &str,
        events: EventHub,
        probe_client: Option<Arc<dyn ProbeClient>>,
    ) -> Self {
        let keys = split_config_keys(raw)
            .into_iter()
            .filter_map(|secret| {
                let parts = parse_gcp_secret(&secret)?;
                Some(Key::new(
                    Service::Gcp,
                    secret,
                    [ModelFamily::GcpClaude],
                    KeyDetail::Gcp {
                        project_id: parts.project_id,
                        client_email: parts.client_email,
                        region: parts.region,
                        access_token: String::new(),
                        access_token_expires_at: 0,
                        sonnet_enabled: true,
                        haiku_enabled: false,
                        sonnet35_enabled: false,
                    },
                ))
            })
            .collect();
        let ring = KeyRing::new(
            Service::Gcp,
            KEY_REUSE_DELAY,
            RATE_LIMIT_LOCKOUT,
            keys,
            events,
        );
        // Variant discovery runs once; GCP keys are not re-probed.
        let checker = probe_client.map(|client| {
            spawn_checker(
                ring.clone(),
                Arc::new(GcpProbe),
                client,
                CheckerConfig {
                    batch_size: 2,
                    recurring: false,
                    ..Default::default()
                },
            )
        });
        Self { ring, checker }
    }
}

#[async_trait]
impl KeyProvider for GcpKeyProvider {
    fn service(&self) -> Service {
        Service::Gcp
    }

    fn ring(&self) -> &Arc<KeyRing> {
        &self.ring
    }

    async fn get(&self, model: &str) -> Result<Key, KeyPoolError> {
        let family =
            family_of(model).ok_or_else(|| KeyPoolError::UnknownModel(model.to_string()))?;
        let wants_sonnet35 = model.contains("3-5-sonnet");
        let wants_haiku = model.contains("haiku");
        self.ring
            .acquire(
                family,
                move |key| match &key.detail {
                    KeyDetail::Gcp {
                        sonnet_enabled,
                        haiku_enabled,
                        sonnet35_enabled,
                        ..
                    } => {
                        if wants_sonnet35 {
                            *sonnet35_enabled
                        } else if wants_haiku {
                            *haiku_enabled
                        } else {
                            *sonnet_enabled
                        }
                    }
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

struct GcpProbe;

impl GcpProbe {
    fn variant_request(parts: &GcpCredentialParts, model_id: &str) -> ProbeRequest {
        let url = format!(
            "https://{region}-aiplatform.googleapis.com/v1/projects/{project}/locations/{region}/publishers/anthropic/models/{model_id}:rawPredict",
            region = parts.region,
            project = parts.project_id,
        );
        ProbeRequest::post(
            url,
            serde_json::to_vec(&serde_json::json!({
                "anthropic_version": "vertex-2023-10-16",
                "max_tokens": 1,
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .unwrap_or_default(),
        )
        .auth(ProbeAuth::GcpOauth {
            client_email: parts.client_email.clone(),
            private_key_b64: parts.private_key_b64.clone(),
        })
    }
}

#[async_trait]
impl KeyProbe for GcpProbe {
    async fn probe(&self, client: &dyn ProbeClient, key: &Key) -> ProbeOutcome {
        let Some(parts) = parse_gcp_secret(&key.secret) else {
            return ProbeOutcome::Invalid;
        };

        let mut enabled = [false; 3];
        let mut any_auth_error = false;
        for (slot, model_id) in [SONNET_ID, SONNET35_ID, HAIKU_ID].iter().enumerate() {
            let response = match client
                .send(Self::variant_request(&parts, model_id))
                .await
            {
                Ok(response) => response,
                Err(message) => return ProbeOutcome::Network(message),
            };
            match response.status {
                200 | 429 | 503 => enabled[slot] = true,
                400 if response.body_text().contains("max_tokens") => enabled[slot] = true,
                401 => {
                    any_auth_error = true;
                    break;
                }
                403 | 404 => {}
                status if (500..600).contains(&status) => enabled[slot] = true,
                _ => {}
            }
        }
        if any_auth_error {
            return ProbeOutcome::Invalid;
        }
        let [sonnet_enabled, sonnet35_enabled, haiku_enabled] = enabled;
        if !sonnet_enabled && !sonnet35_enabled && !haiku_enabled {
            return ProbeOutcome::OverQuota;
        }

        let (access_token, access_token_expires_at) = match &key.detail {
            KeyDetail::Gcp {
                access_token,
                access_token_expires_at,
                ..
            } => (access_token.clone(), *access_token_expires_at),
            _ => (String::new(), 0),
        };
        ProbeOutcome::Healthy(KeyPatch {
            model_families: Some(family_set([ModelFamily::GcpClaude])),
            detail: Some(KeyDetail::Gcp {
                project_id: parts.project_id,
                client_email: parts.client_email,
                region: parts.region,
                access_token,
                access_token_expires_at,
                sonnet_enabled,
                haiku_enabled,
                sonnet35_enabled,
            }),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_secret_keeps_key_material_intact() {
        let parts =
            parse_gcp_secret("proj-1:svc@proj-1.iam.gserviceaccount.com:us-east5:TUlJRXZ3SUJBREFOQmdrcWhraUc5")
                .unwrap();
        assert_eq!(parts.project_id, "proj-1");
        assert_eq!(parts.region, "us-east5");
        assert!(parts.private_key_b64.starts_with("TUlJRXZ3"));
        assert!(parse_gcp_secret("proj:only-two-parts").is_none());
    }
}
