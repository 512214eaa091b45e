//! Background credential probing.
//!
//! Each provider with a checker runs one loop: it walks the ring on a short
//! cadence, probes keys that are due, and applies the classified outcome.
//! The HTTP transport is abstracted behind `ProbeClient` so the loop itself
//! owns no IO and tests can stub upstream behavior.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::events::Event;
use crate::key::{Key, KeyPatch, now_ms};
use crate::ring::KeyRing;

/// Delay before re-probing a key that answered 429 or failed at transport.
pub const RETRY_PROBE_DELAY: Duration = Duration::from_secs(60);
/// Cadence of the due-key scan.
const SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Credential-derived auth the transport must attach before sending.
///
/// Probes are built inside this crate, which owns no crypto; signature and
/// token exchange happen in the transport implementation.
#[derive(Debug, Clone)]
pub enum ProbeAuth {
    None,
    AwsSigV4 {
        access_key_id: String,
        secret_access_key: String,
        region: String,
        service: &'static str,
    },
    GcpOauth {
        client_email: String,
        private_key_b64: String,
    },
}

#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub auth: ProbeAuth,
}

impl ProbeRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET",
            url: url.into(),
            headers: Vec::new(),
            body: None,
            auth: ProbeAuth::None,
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: "POST",
            url: url.into(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Some(body),
            auth: ProbeAuth::None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn auth(mut self, auth: ProbeAuth) -> Self {
        self.auth = auth;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ProbeResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

#[async_trait]
pub trait ProbeClient: Send + Sync {
    async fn send(&self, req: ProbeRequest) -> Result<ProbeResponse, String>;
}

/// Classified result of probing one key.
#[derive(Debug)]
pub enum ProbeOutcome {
    /// Key is healthy; merge the discovered capabilities.
    Healthy(KeyPatch),
    /// Healthy, and the probe discovered sibling keys (OpenAI org clones).
    HealthyWithClones(KeyPatch, Vec<Key>),
    /// Credential invalid or revoked upstream.
    Invalid,
    /// Billing/quota exhausted; unusable but not revoked.
    OverQuota,
    /// Probe itself was rate limited; try again shortly.
    RateLimited,
    /// Transport-level failure; try again shortly.
    Network(String),
    /// Unrecognized upstream answer; log it and reschedule normally.
    Unknown(u16, String),
}

#[async_trait]
pub trait KeyProbe: Send + Sync {
    async fn probe(&self, client: &dyn ProbeClient, key: &Key) -> ProbeOutcome;
}

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Floor between two successful probes of the same key.
    pub min_check_interval: Duration,
    /// Maximum keys probed per scan.
    pub batch_size: usize,
    /// Whether keys are re-probed after the initial validation pass.
    pub recurring: bool,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            min_check_interval: Duration::from_secs(6 * 60 * 60),
            batch_size: 4,
            recurring: false,
        }
    }
}

pub struct CheckerHandle {
    wake: Arc<Notify>,
}

impl CheckerHandle {
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

pub fn spawn_checker(
    ring: Arc<KeyRing>,
    probe: Arc<dyn KeyProbe>,
    client: Arc<dyn ProbeClient>,
    config: CheckerConfig,
) -> CheckerHandle {
    let wake = Arc::new(Notify::new());
    let task_wake = wake.clone();
    tokio::spawn(async move {
        // Probe-retry schedule for keys that hit 429 / transport errors;
        // lives only in the loop, so a recheck() reset clears it implicitly
        // (last_checked going to zero makes the key due regardless).
        let mut not_before: HashMap<String, u64> = HashMap::new();
        loop {
            run_scan(&ring, probe.as_ref(), client.as_ref(), &config, &mut not_before).await;
            tokio::select! {
                _ = tokio::time::sleep(SCAN_INTERVAL) => {}
                _ = task_wake.notified() => {}
            }
        }
    });
    CheckerHandle { wake }
}

async fn run_scan(
    ring: &Arc<KeyRing>,
    probe: &dyn KeyProbe,
    client: &dyn ProbeClient,
    config: &CheckerConfig,
    not_before: &mut HashMap<String, u64>,
) {
    let now = now_ms();
    let min_interval_ms = config.min_check_interval.as_millis() as u64;
    let due: Vec<Key> = ring
        .snapshot()
        .await
        .into_iter()
        .filter(|key| !key.is_disabled)
        .filter(|key| match not_before.get(&key.hash) {
            Some(at) => now >= *at,
            None => true,
        })
        .filter(|key| {
            key.last_checked == 0
                || (config.recurring
                    && now.saturating_sub(key.last_checked) >= min_interval_ms)
        })
        .take(config.batch_size.max(1))
        .collect();

    for key in due {
        let outcome = probe.probe(client, &key).await;
        apply_outcome(ring, &key, outcome, not_before).await;
    }
}

async fn apply_outcome(
    ring: &Arc<KeyRing>,
    key: &Key,
    outcome: ProbeOutcome,
    not_before: &mut HashMap<String, u64>,
) {
    not_before.remove(&key.hash);
    match outcome {
        ProbeOutcome::Healthy(patch) => {
            apply_healthy(ring, key, patch, Vec::new()).await;
        }
        ProbeOutcome::HealthyWithClones(patch, clones) => {
            apply_healthy(ring, key, patch, clones).await;
        }
        ProbeOutcome::Invalid => {
            warn!(event = "key_check_invalid", service = %ring.service(), hash = %key.hash);
            ring.update(&key.hash, KeyPatch::default()).await;
            ring.disable(&key.hash, true).await;
        }
        ProbeOutcome::OverQuota => {
            warn!(event = "key_check_over_quota", service = %ring.service(), hash = %key.hash);
            ring.update(&key.hash, KeyPatch::default()).await;
            ring.disable(&key.hash, false).await;
        }
        ProbeOutcome::RateLimited => {
            not_before.insert(
                key.hash.clone(),
                now_ms() + RETRY_PROBE_DELAY.as_millis() as u64,
            );
        }
        ProbeOutcome::Network(message) => {
            warn!(
                event = "key_check_network_error",
                service = %ring.service(),
                hash = %key.hash,
                error = %message
            );
            not_before.insert(
                key.hash.clone(),
                now_ms() + RETRY_PROBE_DELAY.as_millis() as u64,
            );
        }
        ProbeOutcome::Unknown(status, body) => {
            warn!(
                event = "key_check_unknown_status",
                service = %ring.service(),
                hash = %key.hash,
                status,
                body = %truncate(&body, 256)
            );
            ring.update(&key.hash, KeyPatch::default()).await;
        }
    }
}

async fn apply_healthy(ring: &Arc<KeyRing>, key: &Key, patch: KeyPatch, clones: Vec<Key>) {
    let families: Vec<_> = patch
        .model_families
        .clone()
        .unwrap_or_else(|| key.model_families.clone())
        .into_iter()
        .collect();
    ring.update(&key.hash, patch).await;
    if !clones.is_empty() {
        info!(
            event = "key_check_clones_discovered",
            service = %ring.service(),
            hash = %key.hash,
            count = clones.len()
        );
        ring.adopt(clones).await;
    }
    ring.events()
        .emit(Event::KeyChecked {
            at: SystemTime::now(),
            service: ring.service(),
            hash: key.hash.clone(),
            families,
        })
        .await;
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Builds a `BTreeSet` of families inline; probes use this constantly.
pub fn family_set<I: IntoIterator<Item = crate::family::ModelFamily>>(
    families: I,
) -> BTreeSet<crate::family::ModelFamily> {
    families.into_iter().collect()
}
