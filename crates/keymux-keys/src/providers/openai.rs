//! OpenAI key provider: snapshot discovery, org cloning, trial detection,
//! header-derived rate-limit lockouts.

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
use crate::key::{Key, KeyDetail, KeyPatch, key_hash, now_ms};
use crate::provider::{KeyProvider, split_config_keys};
use crate::ring::{KeyPoolError, KeyRing};

const KEY_REUSE_DELAY: Duration = Duration::from_millis(1000);
/// Floor for header-derived lockouts.
const MIN_RATE_LIMIT_LOCKOUT: Duration = Duration::from_secs(10);
const API_BASE: &str = "https://api.openai.com";

pub struct OpenAiKeyProvider {
    ring: Arc<KeyRing>,
    checker: Option<CheckerHandle>,
}

impl OpenAiKeyProvider {
    pub fn from_config(
        raw: &str,
        events: EventHub,
        probe_client: Option<Arc<dyn ProbeClient>>,
    ) -> Self {
        let keys = split_config_keys(raw)
            .into_iter()
            .map(|secret| {
                Key::new(
                    Service::OpenAi,
                    secret,
                    [ModelFamily::Turbo],
                    new_detail(None),
                )
            })
            .collect();
        let ring = KeyRing::new(
            Service::OpenAi,
            KEY_REUSE_DELAY,
            MIN_RATE_LIMIT_LOCKOUT,
            keys,
            events,
        );
        let checker = probe_client.map(|client| {
            spawn_checker(
                ring.clone(),
                Arc::new(OpenAiProbe),
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

    /// Applies the `x-ratelimit-reset-requests` / `-tokens` headers from a
    /// live response so the next lockout reflects upstream's own window.
    pub async fn update_rate_limits(&self, hash: &str, requests: Option<&str>, tokens: Option<&str>) {
        let now = now_ms();
        let requests_reset = requests.and_then(parse_reset_duration);
        let tokens_reset = tokens.and_then(parse_reset_duration);
        let snapshot = self.ring.snapshot().await;
        let Some(key) = snapshot.iter().find(|key| key.hash == hash) else {
            return;
        };
        let KeyDetail::OpenAi {
            is_trial,
            is_over_quota,
            organization_id,
            model_ids,
            ..
        } = &key.detail
        else {
            return;
        };
        let detail = KeyDetail::OpenAi {
            is_trial: *is_trial,
            is_over_quota: *is_over_quota,
            organization_id: organization_id.clone(),
            rate_limit_requests_reset: requests_reset
                .map(|d| now + d.as_millis() as u64)
                .unwrap_or(0),
            rate_limit_tokens_reset: tokens_reset
                .map(|d| now + d.as_millis() as u64)
                .unwrap_or(0),
            model_ids: model_ids.clone(),
        };
        self.ring
            .update(
                hash,
                KeyPatch {
                    detail: Some(detail),
                    ..Default::default()
                },
            )
            .await;
    }
}

#[async_trait]
impl KeyProvider for OpenAiKeyProvider {
    fn service(&self) -> Service {
        Service::OpenAi
    }

    fn ring(&self) -> &Arc<KeyRing> {
        &self.ring
    }

    async fn get(&self, model: &str) -> Result<Key, KeyPoolError> {
        let family =
            family_of(model).ok_or_else(|| KeyPoolError::UnknownModel(model.to_string()))?;
        let model = model.to_string();
        self.ring
            .acquire(
                family,
                move |key| match &key.detail {
                    KeyDetail::OpenAi {
                        is_over_quota,
                        model_ids,
                        ..
                    } => {
                        // An empty snapshot set means the checker has not run
                        // yet; trust the family tag until it does.
                        !is_over_quota
                            && (model_ids.is_empty() || model_ids.contains(&model))
                    }
                    _ => false,
                },
                Some(&prefer_non_trial),
            )
            .await
    }

    async fn mark_rate_limited(&self, hash: &str) {
        // Upstream tells us when its windows reset; respect whichever is
        // later, with the 10 s floor.
        let now = now_ms();
        let lockout = self
            .ring
            .snapshot()
            .await
            .iter()
            .find(|key| key.hash == hash)
            .and_then(|key| match &key.detail {
                KeyDetail::OpenAi {
                    rate_limit_requests_reset,
                    rate_limit_tokens_reset,
                    ..
                } => {
                    let reset = (*rate_limit_requests_reset).max(*rate_limit_tokens_reset);
                    (reset > now).then(|| Duration::from_millis(reset - now))
                }
                _ => None,
            })
            .map_or(MIN_RATE_LIMIT_LOCKOUT, |derived| {
                derived.max(MIN_RATE_LIMIT_LOCKOUT)
            });
        self.ring.mark_rate_limited_for(hash, lockout).await;
    }

    fn wake_checker(&self) {
        if let Some(checker) = &self.checker {
            checker.wake();
        }
    }
}

fn prefer_non_trial(a: &Key, b: &Key) -> std::cmp::Ordering {
    let trial = |key: &Key| match &key.detail {
        KeyDetail::OpenAi { is_trial, .. } => *is_trial,
        _ => false,
    };
    trial(a).cmp(&trial(b))
}

fn new_detail(organization_id: Option<String>) -> KeyDetail {
    KeyDetail::OpenAi {
        is_trial: false,
        is_over_quota: false,
        organization_id,
        rate_limit_requests_reset: 0,
        rate_limit_tokens_reset: 0,
        model_ids: BTreeSet::new(),
    }
}

/// Parses OpenAI reset header values like "250ms", "1s", "6m12s", "1h3m".
fn parse_reset_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() || ch == '.' {
            digits.push(ch);
            continue;
        }
        let value: f64 = digits.parse().ok()?;
        digits.clear();
        let unit = match ch {
            'h' => 3_600_000.0,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1.0
            }
            'm' => 60_000.0,
            's' => 1_000.0,
            _ => return None,
        };
        total += Duration::from_millis((value * unit) as u64);
    }
    digits.is_empty().then_some(total)
}

struct OpenAiProbe;

#[derive(Deserialize)]
struct ModelsPage {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Deserialize)]
struct ErrorPage {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Deserialize)]
struct OrgsPage {
    data: Vec<OrgEntry>,
}

#[derive(Deserialize)]
struct OrgEntry {
    id: String,
    #[serde(default)]
    is_default: bool,
}

#[async_trait]
impl KeyProbe for OpenAiProbe {
    async fn probe(&self, client: &dyn ProbeClient, key: &Key) -> ProbeOutcome {
        let models = match client
            .send(
                ProbeRequest::get(format!("{API_BASE}/v1/models"))
                    .header("authorization", format!("Bearer {}", key.secret)),
            )
            .await
        {
            Ok(response) => response,
            Err(message) => return ProbeOutcome::Network(message),
        };

        match models.status {
            200 => {}
            401 | 403 => return ProbeOutcome::Invalid,
            429 => return ProbeOutcome::RateLimited,
            status => return ProbeOutcome::Unknown(status, models.body_text()),
        }

        let page: ModelsPage = match serde_json::from_slice(&models.body) {
            Ok(page) => page,
            Err(err) => return ProbeOutcome::Unknown(200, err.to_string()),
        };
        let model_ids: BTreeSet<String> = page.data.into_iter().map(|entry| entry.id).collect();
        let families = families_from_models(&model_ids);

        // A deliberately invalid completion distinguishes live, trial and
        // exhausted billing states without spending tokens.
        let trial_check = client
            .send(
                ProbeRequest::post(
                    format!("{API_BASE}/v1/chat/completions"),
                    br#"{"model":"gpt-3.5-turbo","messages":[{"role":"user","content":""}],"max_tokens":-1}"#.to_vec(),
                )
                .header("authorization", format!("Bearer {}", key.secret)),
            )
            .await;
        let (is_trial, is_over_quota) = match trial_check {
            Ok(response) if response.status == 400 || response.status == 429 => {
                match serde_json::from_slice::<ErrorPage>(&response.body) {
                    Ok(page) => classify_billing_error(&page.error),
                    Err(_) => (false, false),
                }
            }
            Ok(_) | Err(_) => (false, false),
        };
        if is_over_quota {
            return ProbeOutcome::OverQuota;
        }

        let orgs = client
            .send(
                ProbeRequest::get(format!("{API_BASE}/v1/organizations"))
                    .header("authorization", format!("Bearer {}", key.secret)),
            )
            .await;
        let mut clones = Vec::new();
        let mut own_org = current_org(key);
        if let Ok(response) = orgs {
            if response.status == 200
                && let Ok(page) = serde_json::from_slice::<OrgsPage>(&response.body)
            {
                for org in &page.data {
                    if org.is_default {
                        own_org = Some(org.id.clone());
                    }
                }
                for org in page.data {
                    if Some(&org.id) == own_org.as_ref() {
                        continue;
                    }
                    let mut clone = Key::new(
                        Service::OpenAi,
                        key.secret.clone(),
                        families.iter().copied(),
                        KeyDetail::OpenAi {
                            is_trial,
                            is_over_quota: false,
                            organization_id: Some(org.id.clone()),
                            rate_limit_requests_reset: 0,
                            rate_limit_tokens_reset: 0,
                            model_ids: model_ids.clone(),
                        },
                    );
                    clone.hash = key_hash(Service::OpenAi, &key.secret, Some(&org.id));
                    clone.last_checked = now_ms();
                    clones.push(clone);
                }
            }
        }

        let patch = KeyPatch {
            model_families: Some(families),
            detail: Some(KeyDetail::OpenAi {
                is_trial,
                is_over_quota: false,
                organization_id: own_org,
                rate_limit_requests_reset: 0,
                rate_limit_tokens_reset: 0,
                model_ids,
            }),
            ..Default::default()
        };
        if clones.is_empty() {
            ProbeOutcome::Healthy(patch)
        } else {
            ProbeOutcome::HealthyWithClones(patch, clones)
        }
    }
}

fn current_org(key: &Key) -> Option<String> {
    match &key.detail {
        KeyDetail::OpenAi {
            organization_id, ..
        } => organization_id.clone(),
        _ => None,
    }
}

fn classify_billing_error(error: &ErrorDetail) -> (bool, bool) {
    let code = error.code.as_deref().unwrap_or("");
    let kind = error.kind.as_deref().unwrap_or("");
    let message = error.message.as_deref().unwrap_or("");
    if code == "insufficient_quota"
        || code == "billing_hard_limit_reached"
        || kind == "insufficient_quota"
    {
        return (false, true);
    }
    if code == "access_terminated" {
        return (false, true);
    }
    let is_trial = message.contains("trial") || code == "rate_limit_exceeded_free_tier";
    (is_trial, false)
}

fn families_from_models(model_ids: &BTreeSet<String>) -> BTreeSet<ModelFamily> {
    let mut families = family_set([ModelFamily::Turbo]);
    for id in model_ids {
        if let Some(family) = family_of(id) {
            families.insert(family);
        }
    }
    families
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_duration_parser_handles_mixed_units() {
        assert_eq!(parse_reset_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_reset_duration("1s"), Some(Duration::from_secs(1)));
        assert_eq!(
            parse_reset_duration("6m12s"),
            Some(Duration::from_secs(6 * 60 + 12))
        );
        assert_eq!(
            parse_reset_duration("1h3m"),
            Some(Duration::from_secs(3600 + 180))
        );
        assert_eq!(parse_reset_duration("junk"), None);
    }

    #[test]
    fn families_follow_discovered_snapshots() {
        let mut ids = BTreeSet::new();
        ids.insert("gpt-4o-2024-05-13".to_string());
        ids.insert("gpt-3.5-turbo".to_string());
        ids.insert("dall-e-3".to_string());
        let families = families_from_models(&ids);
        assert!(families.contains(&ModelFamily::Gpt4o));
        assert!(families.contains(&ModelFamily::Turbo));
        assert!(families.contains(&ModelFamily::Dalle));
        assert!(!families.contains(&ModelFamily::Gpt4));
    }
}
