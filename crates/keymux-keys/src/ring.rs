//! Shared per-provider key storage.
//!
//! Every provider owns one `KeyRing`: a mutex-guarded slice of `Key` records
//! plus the provider's selection constants. All mutation goes through ring
//! methods; readers get shallow copies. A background watcher emits
//! rate-limit-ended events when lockout windows elapse.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;
use tracing::warn;

use crate::events::{Event, EventHub};
use crate::family::{ModelFamily, Service};
use crate::key::{Key, KeyPatch, now_ms};
use crate::prioritizer::{Tiebreaker, prioritize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPoolError {
    /// No enabled credential in the family can serve the model.
    NoKeyAvailable(ModelFamily),
    /// The model string maps to no known family.
    UnknownModel(String),
    /// No provider is configured for the service.
    ServiceNotConfigured(Service),
}

impl std::fmt::Display for KeyPoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyPoolError::NoKeyAvailable(family) => {
                write!(f, "no key available for family {family}")
            }
            KeyPoolError::UnknownModel(model) => write!(f, "unknown model: {model}"),
            KeyPoolError::ServiceNotConfigured(service) => {
                write!(f, "service not configured: {service}")
            }
        }
    }
}

impl std::error::Error for KeyPoolError {}

pub struct KeyRing {
    service: Service,
    reuse_delay: Duration,
    rate_limit_lockout: Duration,
    keys: Mutex<Vec<Key>>,
    events: EventHub,
    watcher: Arc<LockoutWatcher>,
}

impl KeyRing {
    pub fn new(
        service: Service,
        reuse_delay: Duration,
        rate_limit_lockout: Duration,
        keys: Vec<Key>,
        events: EventHub,
    ) -> Arc<Self> {
        let ring = Arc::new(Self {
            service,
            reuse_delay,
            rate_limit_lockout,
            keys: Mutex::new(keys),
            events,
            watcher: Arc::new(LockoutWatcher::new()),
        });
        LockoutWatcher::spawn(ring.clone());
        ring
    }

    pub fn service(&self) -> Service {
        self.service
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn rate_limit_lockout(&self) -> Duration {
        self.rate_limit_lockout
    }

    /// Selects a key for `family`, applying the caller's eligibility filter
    /// and tiebreaker, then throttles it so the same key is not immediately
    /// reassigned while this request is in flight.
    pub async fn acquire(
        &self,
        family: ModelFamily,
        eligible: impl Fn(&Key) -> bool,
        tiebreaker: Option<Tiebreaker<'_>>,
    ) -> Result<Key, KeyPoolError> {
        let now = now_ms();
        let mut guard = self.keys.lock().await;
        let mut candidates: Vec<Key> = guard
            .iter()
            .filter(|key| !key.is_disabled && key.serves_family(family) && eligible(key))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(KeyPoolError::NoKeyAvailable(family));
        }
        prioritize(&mut candidates, now, tiebreaker);
        let chosen_hash = candidates[0].hash.clone();

        let throttle_until = now + self.reuse_delay.as_millis() as u64;
        let Some(chosen) = guard.iter_mut().find(|key| key.hash == chosen_hash) else {
            return Err(KeyPoolError::NoKeyAvailable(family));
        };
        chosen.last_used = now;
        chosen.rate_limited_until = chosen.rate_limited_until.max(throttle_until);
        let copy = chosen.clone();
        drop(guard);

        self.watcher.push(copy.rate_limited_until).await;
        Ok(copy)
    }

    pub async fn list(&self) -> Vec<Key> {
        self.keys
            .lock()
            .await
            .iter()
            .map(Key::listing_copy)
            .collect()
    }

    pub async fn key_count(&self) -> usize {
        self.keys.lock().await.len()
    }

    pub async fn disable(&self, hash: &str, revoke: bool) {
        let mut changed = false;
        {
            let mut guard = self.keys.lock().await;
            if let Some(key) = guard.iter_mut().find(|key| key.hash == hash) {
                // Idempotent: re-disabling an already disabled key is a no-op
                // unless it upgrades to revoked.
                if !key.is_disabled || (revoke && !key.is_revoked) {
                    key.is_disabled = true;
                    key.is_revoked = key.is_revoked || revoke;
                    changed = true;
                }
            }
        }
        if changed {
            self.events
                .emit(Event::KeyDisabled {
                    at: SystemTime::now(),
                    service: self.service,
                    hash: hash.to_string(),
                    revoked: revoke,
                })
                .await;
        }
    }

    pub async fn update(&self, hash: &str, patch: KeyPatch) {
        let mut guard = self.keys.lock().await;
        match guard.iter_mut().find(|key| key.hash == hash) {
            Some(key) => patch.apply(key, now_ms()),
            None => warn!(event = "key_update_missing", hash = %hash),
        }
    }

    pub async fn increment_usage(&self, hash: &str, family: ModelFamily, tokens: u64) {
        let mut guard = self.keys.lock().await;
        if let Some(key) = guard.iter_mut().find(|key| key.hash == hash) {
            key.prompt_count += 1;
            *key.token_usage.entry(family).or_insert(0) += tokens;
        }
    }

    pub async fn mark_rate_limited(&self, hash: &str) {
        self.mark_rate_limited_for(hash, self.rate_limit_lockout)
            .await;
    }

    /// Variant used by providers that derive the lockout from response
    /// headers instead of the fixed constant.
    pub async fn mark_rate_limited_for(&self, hash: &str, lockout: Duration) {
        let now = now_ms();
        let until = now + lockout.as_millis() as u64;
        let mut emitted_until = None;
        {
            let mut guard = self.keys.lock().await;
            if let Some(key) = guard.iter_mut().find(|key| key.hash == hash) {
                key.rate_limited_at = now;
                key.rate_limited_until = until;
                emitted_until = Some(until);
            }
        }
        if let Some(until_ms) = emitted_until {
            self.watcher.push(until_ms).await;
            self.events
                .emit(Event::KeyRateLimited {
                    at: SystemTime::now(),
                    service: self.service,
                    hash: hash.to_string(),
                    until_ms,
                })
                .await;
        }
    }

    /// 0 when any enabled key in the family is currently usable, or when the
    /// family has no enabled keys at all (the request then fails downstream
    /// with `NoKeyAvailable` instead of waiting forever).
    pub async fn lockout_period(&self, family: ModelFamily) -> Duration {
        let now = now_ms();
        let guard = self.keys.lock().await;
        let mut earliest: Option<u64> = None;
        let mut any_enabled = false;
        for key in guard.iter() {
            if key.is_disabled || !key.serves_family(family) {
                continue;
            }
            any_enabled = true;
            if !key.is_rate_limited(now) {
                return Duration::ZERO;
            }
            let remaining = key.rate_limited_until - now;
            earliest = Some(earliest.map_or(remaining, |e| e.min(remaining)));
        }
        if !any_enabled {
            return Duration::ZERO;
        }
        Duration::from_millis(earliest.unwrap_or(0))
    }

    /// Clears check/disable state so the checker revisits every key.
    pub async fn reset_for_recheck(&self) {
        let mut guard = self.keys.lock().await;
        for key in guard.iter_mut() {
            key.last_checked = 0;
            key.is_disabled = false;
            key.is_revoked = false;
        }
    }

    /// Full copies for the checker loop (secrets included).
    pub async fn snapshot(&self) -> Vec<Key> {
        self.keys.lock().await.clone()
    }

    /// Adds checker-discovered sibling keys (OpenAI organization clones).
    /// Duplicate hashes are skipped.
    pub async fn adopt(&self, keys: Vec<Key>) {
        let mut guard = self.keys.lock().await;
        for key in keys {
            if guard.iter().all(|existing| existing.hash != key.hash) {
                guard.push(key);
            }
        }
    }

    async fn emit_expired(&self, now: u64) {
        let expired: Vec<String> = {
            let guard = self.keys.lock().await;
            guard
                .iter()
                .filter(|key| {
                    key.rate_limited_at > 0
                        && key.rate_limited_until > 0
                        && key.rate_limited_until <= now
                })
                .map(|key| key.hash.clone())
                .collect()
        };
        // Clear the window markers so each expiry is announced once.
        {
            let mut guard = self.keys.lock().await;
            for key in guard.iter_mut() {
                if expired.contains(&key.hash) {
                    key.rate_limited_at = 0;
                }
            }
        }
        for hash in expired {
            self.events
                .emit(Event::KeyRateLimitEnded {
                    at: SystemTime::now(),
                    service: self.service,
                    hash,
                })
                .await;
        }
    }
}

/// Min-heap of lockout deadlines plus a notify, so expiry events fire when
/// windows elapse instead of on a polling sweep. Stale entries are fine: the
/// ring re-checks actual timestamps before announcing.
struct LockoutWatcher {
    deadlines: Mutex<BinaryHeap<Reverse<u64>>>,
    notify: Notify,
}

impl LockoutWatcher {
    fn new() -> Self {
        Self {
            deadlines: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }

    async fn push(&self, until_ms: u64) {
        self.deadlines.lock().await.push(Reverse(until_ms));
        self.notify.notify_one();
    }

    fn spawn(ring: Arc<KeyRing>) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = ring.watcher.deadlines.lock().await;
                    heap.peek().map(|Reverse(t)| *t)
                };
                match next {
                    None => ring.watcher.notify.notified().await,
                    Some(deadline) => {
                        let now = now_ms();
                        if deadline > now {
                            sleep(Duration::from_millis(deadline - now)).await;
                        }
                        let now = now_ms();
                        {
                            let mut heap = ring.watcher.deadlines.lock().await;
                            while matches!(heap.peek(), Some(Reverse(t)) if *t <= now) {
                                heap.pop();
                            }
                        }
                        ring.emit_expired(now).await;
                    }
                }
            }
        });
    }
}
