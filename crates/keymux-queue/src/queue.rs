//! The partitioned request queue and its scheduler.
//!
//! One global ordered list; partitions are computed on demand by filtering
//! on model family. The scheduler tick drains at most one request per family
//! per tick, and only when the key pool reports a zero lockout for that
//! family, so a rate-limited family never starves the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use keymux_keys::{Event, EventHub, KeyPool, ModelFamily, now_ms};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info};

use crate::estimator::{WaitEstimator, WaitSample};

pub const SCHEDULER_TICK: Duration = Duration::from_millis(50);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(20);
/// Requests queued longer than this are killed with a terminal error.
pub const MAX_QUEUE_AGE: Duration = Duration::from_secs(5 * 60);
pub const WAIT_TIME_INTERVAL: Duration = Duration::from_secs(3);
/// Cost weight applied to prompt + requested output tokens when picking the
/// next request, so oversized prompts yield to cheap ones queued just after.
pub const TOKENS_PUNISHMENT_FACTOR: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct Ticket {
    pub id: String,
    pub identity: String,
    pub family: ModelFamily,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    pub streaming: bool,
}

/// Payload delivered when the scheduler picks (or kills) a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dequeue {
    Ready,
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The identity already holds its full share of queue slots.
    TooManyRequests,
    /// Load is past the threshold and the client did not opt into streaming.
    StreamRequired,
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnqueueError::TooManyRequests => write!(f, "identity has too many queued requests"),
            EnqueueError::StreamRequired => {
                write!(f, "proxy is under load; retry with streaming enabled")
            }
        }
    }
}

impl std::error::Error for EnqueueError {}

pub struct QueuedHandle {
    pub id: String,
    /// Position at join time, 1-based, for the SSE join comment.
    pub position: usize,
    pub start_ms: u64,
    pub retry_count: u32,
    pub rx: oneshot::Receiver<Dequeue>,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub user_concurrency_limit: usize,
    pub load_threshold: usize,
}

struct Entry {
    ticket: Ticket,
    start_ms: u64,
    retry_count: u32,
    tx: oneshot::Sender<Dequeue>,
}

impl Entry {
    fn deadline(&self) -> f64 {
        let tokens = (self.ticket.prompt_tokens + self.ticket.output_tokens) as f64;
        self.start_ms as f64 + TOKENS_PUNISHMENT_FACTOR * tokens
    }
}

struct Inner {
    entries: Vec<Entry>,
    estimator: WaitEstimator,
}

pub struct RequestQueue {
    inner: Mutex<Inner>,
    config: QueueConfig,
    events: EventHub,
}

impl RequestQueue {
    pub fn new(config: QueueConfig, events: EventHub) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                estimator: WaitEstimator::new(),
            }),
            config,
            events,
        })
    }

    /// Starts the scheduler, cleanup, and estimator loops.
    pub fn spawn(self: &Arc<Self>, pool: Arc<KeyPool>) {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SCHEDULER_TICK);
            let mut last_cleanup = now_ms();
            let mut last_estimate = now_ms();
            loop {
                tick.tick().await;
                queue.dispatch_ready(&pool).await;
                let now = now_ms();
                if now.saturating_sub(last_cleanup) >= CLEANUP_INTERVAL.as_millis() as u64 {
                    last_cleanup = now;
                    queue.kill_stale(now).await;
                }
                if now.saturating_sub(last_estimate) >= WAIT_TIME_INTERVAL.as_millis() as u64 {
                    last_estimate = now;
                    queue.tick_estimator(now).await;
                }
            }
        });
    }

    pub async fn enqueue(&self, ticket: Ticket) -> Result<QueuedHandle, EnqueueError> {
        let mut inner = self.inner.lock().await;
        let held = inner
            .entries
            .iter()
            .filter(|entry| entry.ticket.identity == ticket.identity)
            .count();
        if held >= self.config.user_concurrency_limit {
            return Err(EnqueueError::TooManyRequests);
        }
        if inner.entries.len() >= self.config.load_threshold && !ticket.streaming {
            return Err(EnqueueError::StreamRequired);
        }
        Ok(push_entry(&mut inner, ticket, 0))
    }

    /// Puts a request back after a retryable failure. The start time resets,
    /// so a retry is never dispatched sooner than a fresh request of the
    /// same weight; the identity cap and load gate do not re-apply.
    pub async fn reenqueue(&self, ticket: Ticket, retry_count: u32) -> QueuedHandle {
        let mut inner = self.inner.lock().await;
        push_entry(&mut inner, ticket, retry_count + 1)
    }

    /// Abort-path removal. Returns false when the request already left the
    /// queue (dispatched or killed).
    pub async fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|entry| entry.ticket.id != id);
        before != inner.entries.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn partition_len(&self, family: ModelFamily) -> usize {
        self.inner
            .lock()
            .await
            .entries
            .iter()
            .filter(|entry| entry.ticket.family == family)
            .count()
    }

    pub async fn estimated_wait(&self, family: ModelFamily) -> Duration {
        self.inner.lock().await.estimator.estimate(family)
    }

    async fn dispatch_ready(&self, pool: &Arc<KeyPool>) {
        let families: Vec<ModelFamily> = {
            let inner = self.inner.lock().await;
            let mut seen = Vec::new();
            for entry in &inner.entries {
                if !seen.contains(&entry.ticket.family) {
                    seen.push(entry.ticket.family);
                }
            }
            seen
        };

        for family in families {
            if !pool.get_lockout_period(family).await.is_zero() {
                continue;
            }
            let now = now_ms();
            let mut inner = self.inner.lock().await;
            let chosen = inner
                .entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.ticket.family == family)
                .min_by(|(_, a), (_, b)| {
                    a.deadline()
                        .partial_cmp(&b.deadline())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(idx, _)| idx);
            let Some(idx) = chosen else {
                continue;
            };
            let entry = inner.entries.remove(idx);
            inner.estimator.record(WaitSample {
                family,
                start_ms: entry.start_ms,
                end_ms: now,
            });
            debug!(
                event = "queue_dispatch",
                request_id = %entry.ticket.id,
                family = %family,
                waited_ms = now.saturating_sub(entry.start_ms),
                retry_count = entry.retry_count
            );
            // A dropped receiver means the client aborted between ticks; the
            // close handler has already cleaned up.
            let _ = entry.tx.send(Dequeue::Ready);
        }
    }

    async fn kill_stale(&self, now: u64) {
        let max_age = MAX_QUEUE_AGE.as_millis() as u64;
        let stale: Vec<Entry> = {
            let mut inner = self.inner.lock().await;
            let (stale, keep) = inner
                .entries
                .drain(..)
                .partition(|entry| now.saturating_sub(entry.start_ms) >= max_age);
            inner.entries = keep;
            stale
        };
        for entry in stale {
            info!(
                event = "queue_request_killed",
                request_id = %entry.ticket.id,
                family = %entry.ticket.family,
                queued_ms = now.saturating_sub(entry.start_ms)
            );
            self.events
                .emit(Event::RequestKilled {
                    at: SystemTime::now(),
                    request_id: entry.ticket.id.clone(),
                    family: entry.ticket.family,
                    queued_ms: now.saturating_sub(entry.start_ms),
                })
                .await;
            let _ = entry.tx.send(Dequeue::Killed);
        }
    }

    async fn tick_estimator(&self, now: u64) {
        let mut inner = self.inner.lock().await;
        let mut longest: HashMap<ModelFamily, u64> = HashMap::new();
        for entry in &inner.entries {
            let waited = now.saturating_sub(entry.start_ms);
            let slot = longest.entry(entry.ticket.family).or_insert(0);
            *slot = (*slot).max(waited);
        }
        inner.estimator.tick(now, &longest);
    }
}

fn push_entry(inner: &mut Inner, ticket: Ticket, retry_count: u32) -> QueuedHandle {
    let (tx, rx) = oneshot::channel();
    let start_ms = now_ms();
    let id = ticket.id.clone();
    inner.entries.push(Entry {
        ticket,
        start_ms,
        retry_count,
        tx,
    });
    QueuedHandle {
        id,
        position: inner.entries.len(),
        start_ms,
        retry_count,
        rx,
    }
}
