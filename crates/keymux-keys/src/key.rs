//! Per-credential runtime state.
//!
//! The secret never leaves the owning provider except inside the shallow
//! copies handed to the dispatch path; `listing_copy` clears it before any
//! state is exposed for display or logging.

use std::collections::{BTreeMap, BTreeSet};

use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::family::{ModelFamily, Service};

pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Short stable identifier derived from the secret (plus, for cloned OpenAI
/// keys, the organization id). Logged everywhere the secret must not be.
pub fn key_hash(service: Service, secret: &str, salt: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    if let Some(salt) = salt {
        hasher.update(b"|");
        hasher.update(salt.as_bytes());
    }
    let digest = hasher.finalize();
    let tail = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&digest[..6]);
    format!("{}-{}", service.as_str(), tail)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AwsLoggingStatus {
    Unknown,
    Disabled,
    Enabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnthropicTier {
    Unknown,
    Free,
    Build,
    Scale,
}

/// Provider-specific capability and account state.
#[derive(Debug, Clone, Serialize)]
pub enum KeyDetail {
    OpenAi {
        is_trial: bool,
        is_over_quota: bool,
        organization_id: Option<String>,
        /// Epoch ms at which the request/token rate-limit windows reset,
        /// parsed from response headers.
        rate_limit_requests_reset: u64,
        rate_limit_tokens_reset: u64,
        /// Discovered snapshot IDs this key may invoke.
        model_ids: BTreeSet<String>,
    },
    Anthropic {
        tier: AnthropicTier,
        is_pozzed: bool,
        is_over_quota: bool,
        requires_preamble: bool,
        allows_multimodality: bool,
    },
    Aws {
        access_key_id: String,
        region: String,
        logging_status: AwsLoggingStatus,
        model_ids: BTreeSet<String>,
        inference_profile_ids: BTreeSet<String>,
    },
    Gcp {
        project_id: String,
        client_email: String,
        region: String,
        access_token: String,
        access_token_expires_at: u64,
        sonnet_enabled: bool,
        haiku_enabled: bool,
        sonnet35_enabled: bool,
    },
    Azure {
        resource_name: String,
        deployment_id: String,
        content_filtering: bool,
        model_ids: BTreeSet<String>,
    },
    GoogleAi,
    Mistral,
}

#[derive(Debug, Clone, Serialize)]
pub struct Key {
    pub hash: String,
    pub service: Service,
    pub model_families: BTreeSet<ModelFamily>,
    pub is_disabled: bool,
    pub is_revoked: bool,
    pub prompt_count: u64,
    pub last_used: u64,
    pub last_checked: u64,
    pub rate_limited_at: u64,
    pub rate_limited_until: u64,
    /// Tokens consumed through this key, by family.
    pub token_usage: BTreeMap<ModelFamily, u64>,
    pub detail: KeyDetail,
    /// Raw secret material. Cleared in listings; never logged.
    #[serde(skip_serializing)]
    pub secret: String,
}

impl Key {
    pub fn new(
        service: Service,
        secret: impl Into<String>,
        families: impl IntoIterator<Item = ModelFamily>,
        detail: KeyDetail,
    ) -> Self {
        let secret = secret.into();
        Self {
            hash: key_hash(service, &secret, None),
            service,
            model_families: families.into_iter().collect(),
            is_disabled: false,
            is_revoked: false,
            prompt_count: 0,
            last_used: 0,
            last_checked: 0,
            rate_limited_at: 0,
            rate_limited_until: 0,
            token_usage: BTreeMap::new(),
            detail,
            secret,
        }
    }

    pub fn is_rate_limited(&self, now: u64) -> bool {
        self.rate_limited_until > now
    }

    pub fn serves_family(&self, family: ModelFamily) -> bool {
        self.model_families.contains(&family)
    }

    /// Copy with the secret cleared, safe for listings and admin views.
    pub fn listing_copy(&self) -> Key {
        let mut copy = self.clone();
        copy.secret.clear();
        copy
    }
}

/// Partial update applied through `KeyProvider::update`.
#[derive(Debug, Clone, Default)]
pub struct KeyPatch {
    pub model_families: Option<BTreeSet<ModelFamily>>,
    pub is_disabled: Option<bool>,
    pub is_revoked: Option<bool>,
    pub rate_limited_at: Option<u64>,
    pub rate_limited_until: Option<u64>,
    pub detail: Option<KeyDetail>,
}

impl KeyPatch {
    /// Merge into `key`, stamping `last_checked` like a checker write.
    pub fn apply(self, key: &mut Key, now: u64) {
        if let Some(families) = self.model_families {
            key.model_families = families;
        }
        if let Some(disabled) = self.is_disabled {
            key.is_disabled = disabled;
        }
        if let Some(revoked) = self.is_revoked {
            key.is_revoked = revoked;
            if revoked {
                key.is_disabled = true;
            }
        }
        if let Some(at) = self.rate_limited_at {
            key.rate_limited_at = at;
        }
        if let Some(until) = self.rate_limited_until {
            key.rate_limited_until = until;
        }
        if let Some(detail) = self.detail {
            key.detail = detail;
        }
        key.last_checked = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_salt_sensitive() {
        let a = key_hash(Service::OpenAi, "sk-test", None);
        let b = key_hash(Service::OpenAi, "sk-test", None);
        let org = key_hash(Service::OpenAi, "sk-test", Some("org-123"));
        assert_eq!(a, b);
        assert_ne!(a, org);
        assert!(a.starts_with("openai-"));
        assert!(!a.contains("sk-test"));
    }

    #[test]
    fn revoking_via_patch_also_disables() {
        let mut key = Key::new(
            Service::Mistral,
            "secret",
            [ModelFamily::MistralSmall],
            KeyDetail::Mistral,
        );
        KeyPatch {
            is_revoked: Some(true),
            ..Default::default()
        }
        .apply(&mut key, 42);
        assert!(key.is_disabled);
        assert!(key.is_revoked);
        assert_eq!(key.last_checked, 42);
    }

    #[test]
    fn listing_copy_strips_secret() {
        let key = Key::new(
            Service::Anthropic,
            "sk-ant-xyz",
            [ModelFamily::Claude],
            KeyDetail::Anthropic {
                tier: AnthropicTier::Unknown,
                is_pozzed: false,
                is_over_quota: false,
                requires_preamble: false,
                allows_multimodality: true,
            },
        );
        assert!(key.listing_copy().secret.is_empty());
        assert_eq!(key.listing_copy().hash, key.hash);
    }
}
