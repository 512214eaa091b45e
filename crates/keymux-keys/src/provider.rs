//! The per-provider key surface the rest of the system talks to.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::family::{ModelFamily, Service, family_of};
use crate::key::{Key, KeyPatch};
use crate::ring::{KeyPoolError, KeyRing};

#[async_trait]
pub trait KeyProvider: Send + Sync {
    fn service(&self) -> Service;

    fn ring(&self) -> &Arc<KeyRing>;

    /// Selects and throttles a key able to serve `model`.
    async fn get(&self, model: &str) -> Result<Key, KeyPoolError>;

    async fn list(&self) -> Vec<Key> {
        self.ring().list().await
    }

    async fn disable(&self, hash: &str, revoke: bool) {
        self.ring().disable(hash, revoke).await;
    }

    async fn update(&self, hash: &str, patch: KeyPatch) {
        self.ring().update(hash, patch).await;
    }

    async fn increment_usage(&self, hash: &str, model: &str, tokens: u64) {
        if let Some(family) = family_of(model) {
            self.ring().increment_usage(hash, family, tokens).await;
        }
    }

    async fn mark_rate_limited(&self, hash: &str) {
        self.ring().mark_rate_limited(hash).await;
    }

    async fn get_lockout_period(&self, family: ModelFamily) -> Duration {
        self.ring().lockout_period(family).await
    }

    /// Resets validation state on every key and wakes the checker.
    async fn recheck(&self) {
        self.ring().reset_for_recheck().await;
        self.wake_checker();
    }

    /// No-op for providers without a background checker.
    fn wake_checker(&self) {}
}

/// Splits a comma-separated credential config string into trimmed secrets,
/// dropping empties and duplicates while keeping configured order.
pub fn split_config_keys(raw: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() || seen.iter().any(|s| s == part) {
            continue;
        }
        seen.push(part.to_string());
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_dedupes_config_keys() {
        let keys = split_config_keys(" sk-a, sk-b,,sk-a , ");
        assert_eq!(keys, vec!["sk-a".to_string(), "sk-b".to_string()]);
    }
}
