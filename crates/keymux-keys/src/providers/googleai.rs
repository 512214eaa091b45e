//! Google AI (Gemini API key) provider. One list-models call categorizes the
//! key; no recurring checks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::checker::{
    CheckerConfig, CheckerHandle, KeyProbe, ProbeClient, ProbeOutcome, ProbeRequest, spawn_checker,
};
use crate::events::EventHub;
use crate::family::{ModelFamily, Service, family_of};
use crate::key::{Key, KeyDetail, KeyPatch};
use crate::provider::{KeyProvider, split_config_keys};
use crate::ring::{KeyPoolError, KeyRing};

const KEY_REUSE_DELAY: Duration = Duration::from_millis(500);
const RATE_LIMIT_LOCKOUT: Duration = Duration::from_millis(2000);
const API_BASE: &str = "https://generativelanguage.googleapis.com";

pub struct GoogleAiKeyProvider {
    ring: Arc<KeyRing>,
    checker: Option<CheckerHandle>,
}

impl GoogleAiKeyProvider {
    pub fn from_config(
        raw: &str,
        events: EventHub,
        probe_client: Option<Arc<dyn ProbeClient>>,
    ) -> Self {
        let keys = split_config_keys(raw)
            .into_iter()
            .map(|secret| {
                Key::new(
                    Service::GoogleAi,
                    secret,
                    [ModelFamily::GeminiPro],
                    KeyDetail::GoogleAi,
                )
            })
            .collect();
        let ring = KeyRing::new(
            Service::GoogleAi,
            KEY_REUSE_DELAY,
            RATE_LIMIT_LOCKOUT,
            keys,
            events,
        );
        let checker = probe_client.map(|client| {
            spawn_checker(
                ring.clone(),
                Arc::new(GoogleAiProbe),
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

#[async_trait]
impl KeyProvider for GoogleAiKeyProvider {
    fn service(&self) -> Service {
        Service::GoogleAi
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

struct GoogleAiProbe;

#[derive(Deserialize)]
struct ModelsPage {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    name: String,
}

#[async_trait]
impl KeyProbe for GoogleAiProbe {
    async fn probe(&self, client: &dyn ProbeClient, key: &Key) -> ProbeOutcome {
        let response = match client
            .send(ProbeRequest::get(format!(
                "{API_BASE}/v1beta/models?key={}",
                key.secret
            )))
            .await
        {
            Ok(response) => response,
            Err(message) => return ProbeOutcome::Network(message),
        };
        match response.status {
            200 => {}
            400 | 401 | 403 => return ProbeOutcome::Invalid,
            429 => return ProbeOutcome::RateLimited,
            status => return ProbeOutcome::Unknown(status, response.body_text()),
        }

        let page: ModelsPage = match serde_json::from_slice(&response.body) {
            Ok(page) => page,
            Err(err) => return ProbeOutcome::Unknown(200, err.to_string()),
        };
        let mut families = std::collections::BTreeSet::new();
        for model in &page.models {
            let name = model.name.strip_prefix("models/").unwrap_or(&model.name);
            if let Some(family) = family_of(name) {
                families.insert(family);
            }
        }
        if families.is_empty() {
            families.insert(ModelFamily::GeminiPro);
        }
        ProbeOutcome::Healthy(KeyPatch {
            model_families: Some(families),
            detail: Some(KeyDetail::GoogleAi),
            ..Default::default()
        })
    }
}
