//! Mistral key provider. No probe: configured families are trusted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::events::EventHub;
use crate::family::{ModelFamily, Service, family_of};
use crate::key::{Key, KeyDetail};
use crate::provider::{KeyProvider, split_config_keys};
use crate::ring::{KeyPoolError, KeyRing};

const KEY_REUSE_DELAY: Duration = Duration::from_millis(500);
const RATE_LIMIT_LOCKOUT: Duration = Duration::from_millis(2000);

pub struct MistralKeyProvider {
    ring: Arc<KeyRing>,
}

impl MistralKeyProvider {
    pub fn from_config(raw: &str, events: EventHub) -> Self {
        let keys = split_config_keys(raw)
            .into_iter()
            .map(|secret| {
                Key::new(
                    Service::Mistral,
                    secret,
                    [
                        ModelFamily::MistralTiny,
                        ModelFamily::MistralSmall,
                        ModelFamily::MistralMedium,
                        ModelFamily::MistralLarge,
                    ],
                    KeyDetail::Mistral,
                )
            })
            .collect();
        let ring = KeyRing::new(
            Service::Mistral,
            KEY_REUSE_DELAY,
            RATE_LIMIT_LOCKOUT,
            keys,
            events,
        );
        Self { ring }
    }
}

#[async_trait]
impl KeyProvider for MistralKeyProvider {
    fn service(&self) -> Service {
        Service::Mistral
    }

    fn ring(&self) -> &Arc<KeyRing> {
        &self.ring
    }

    async fn get(&self, model: &str) -> Result<Key, KeyPoolError> {
        let family =
            family_of(model).ok_or_else(|| KeyPoolError::UnknownModel(model.to_string()))?;
        self.ring.acquire(family, |_| true, None).await
    }
}
