//! Service-agnostic aggregator over the per-provider key providers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use keymux_common::ProxyConfig;

use crate::checker::ProbeClient;
use crate::events::EventHub;
use crate::family::{ModelFamily, Service, family_of};
use crate::key::{Key, KeyPatch};
use crate::provider::KeyProvider;
use crate::providers::{
    AnthropicKeyProvider, AwsKeyProvider, AzureKeyProvider, GcpKeyProvider, GoogleAiKeyProvider,
    MistralKeyProvider, OpenAiKeyProvider,
};
use crate::ring::KeyPoolError;

pub struct KeyPool {
    providers: HashMap<Service, Arc<dyn KeyProvider>>,
    openai: Option<Arc<OpenAiKeyProvider>>,
    events: EventHub,
}

impl KeyPool {
    /// Builds every provider that has at least one configured credential.
    pub fn from_config(
        config: &ProxyConfig,
        events: EventHub,
        probe_client: Option<Arc<dyn ProbeClient>>,
    ) -> Self {
        let mut providers: HashMap<Service, Arc<dyn KeyProvider>> = HashMap::new();
        let mut openai = None;

        let configured = |service: Service| -> Option<&str> {
            config
                .credentials
                .get(service.as_str())
                .map(String::as_str)
                .filter(|raw| !raw.trim().is_empty())
        };

        if let Some(raw) = configured(Service::OpenAi) {
            let provider = Arc::new(OpenAiKeyProvider::from_config(
                raw,
                events.clone(),
                probe_client.clone(),
            ));
            openai = Some(provider.clone());
            providers.insert(Service::OpenAi, provider);
        }
        if let Some(raw) = configured(Service::Anthropic) {
            providers.insert(
                Service::Anthropic,
                Arc::new(AnthropicKeyProvider::from_config(
                    raw,
                    events.clone(),
                    probe_client.clone(),
                )),
            );
        }
        if let Some(raw) = configured(Service::Aws) {
            providers.insert(
                Service::Aws,
                Arc::new(AwsKeyProvider::from_config(
                    raw,
                    config.allow_aws_logging,
                    events.clone(),
                    probe_client.clone(),
                )),
            );
        }
        if let Some(raw) = configured(Service::Gcp) {
            providers.insert(
                Service::Gcp,
                Arc::new(GcpKeyProvider::from_config(
                    raw,
                    events.clone(),
                    probe_client.clone(),
                )),
            );
        }
        if let Some(raw) = configured(Service::Azure) {
            providers.insert(
                Service::Azure,
                Arc::new(AzureKeyProvider::from_config(
                    raw,
                    events.clone(),
                    probe_client.clone(),
                )),
            );
        }
        if let Some(raw) = configured(Service::GoogleAi) {
            providers.insert(
                Service::GoogleAi,
                Arc::new(GoogleAiKeyProvider::from_config(
                    raw,
                    events.clone(),
                    probe_client.clone(),
                )),
            );
        }
        if let Some(raw) = configured(Service::Mistral) {
            providers.insert(
                Service::Mistral,
                Arc::new(MistralKeyProvider::from_config(raw, events.clone())),
            );
        }

        Self {
            providers,
            openai,
            events,
        }
    }

    /// Test constructor with explicit providers.
    pub fn with_providers(
        providers: HashMap<Service, Arc<dyn KeyProvider>>,
        events: EventHub,
    ) -> Self {
        Self {
            providers,
            openai: None,
            events,
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn provider(&self, service: Service) -> Option<&Arc<dyn KeyProvider>> {
        self.providers.get(&service)
    }

    pub fn configured_services(&self) -> Vec<Service> {
        self.providers.keys().copied().collect()
    }

    fn provider_for_model(&self, model: &str) -> Result<&Arc<dyn KeyProvider>, KeyPoolError> {
        let family =
            family_of(model).ok_or_else(|| KeyPoolError::UnknownModel(model.to_string()))?;
        self.providers
            .get(&family.service())
            .ok_or(KeyPoolError::ServiceNotConfigured(family.service()))
    }

    pub async fn get(&self, model: &str) -> Result<Key, KeyPoolError> {
        self.provider_for_model(model)?.get(model).await
    }

    pub async fn list(&self) -> Vec<Key> {
        let mut keys = Vec::new();
        for provider in self.providers.values() {
            keys.extend(provider.list().await);
        }
        keys
    }

    pub async fn disable(&self, key: &Key, revoke: bool) {
        if let Some(provider) = self.providers.get(&key.service) {
            provider.disable(&key.hash, revoke).await;
        }
    }

    pub async fn update(&self, service: Service, hash: &str, patch: KeyPatch) {
        if let Some(provider) = self.providers.get(&service) {
            provider.update(hash, patch).await;
        }
    }

    pub async fn mark_rate_limited(&self, service: Service, hash: &str) {
        if let Some(provider) = self.providers.get(&service) {
            provider.mark_rate_limited(hash).await;
        }
    }

    pub async fn increment_usage(&self, key: &Key, model: &str, tokens: u64) {
        if let Some(provider) = self.providers.get(&key.service) {
            provider.increment_usage(&key.hash, model, tokens).await;
        }
    }

    /// OpenAI-only: feed the rate-limit reset headers from a live response
    /// back into the key record.
    pub async fn update_rate_limits(
        &self,
        hash: &str,
        requests_reset: Option<&str>,
        tokens_reset: Option<&str>,
    ) {
        if let Some(openai) = &self.openai {
            openai
                .update_rate_limits(hash, requests_reset, tokens_reset)
                .await;
        }
    }

    /// Lockout for a family, or zero when the family's service is not
    /// configured (the request will fail with `NoKeyAvailable` instead).
    pub async fn get_lockout_period(&self, family: ModelFamily) -> Duration {
        match self.providers.get(&family.service()) {
            Some(provider) => provider.get_lockout_period(family).await,
            None => Duration::ZERO,
        }
    }

    pub async fn recheck(&self) {
        for provider in self.providers.values() {
            provider.recheck().await;
        }
    }
}
