//! Operational event fan-out.
//!
//! Events are broadcast to in-process subscribers and forwarded to any
//! registered sinks (the persistent sink collaborator plugs in here).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tracing::info;

use crate::family::{ModelFamily, Service};

#[derive(Debug, Clone, Serialize)]
pub enum Event {
    KeyDisabled {
        at: SystemTime,
        service: Service,
        hash: String,
        revoked: bool,
    },
    KeyRateLimited {
        at: SystemTime,
        service: Service,
        hash: String,
        until_ms: u64,
    },
    KeyRateLimitEnded {
        at: SystemTime,
        service: Service,
        hash: String,
    },
    KeyChecked {
        at: SystemTime,
        service: Service,
        hash: String,
        families: Vec<ModelFamily>,
    },
    RequestKilled {
        at: SystemTime,
        request_id: String,
        family: ModelFamily,
        queued_ms: u64,
    },
}

pub trait EventSink: Send + Sync {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<Event>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            inner: Arc::new(Inner {
                tx,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.tx.subscribe()
    }

    pub async fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.inner.sinks.write().await.push(sink);
    }

    pub async fn emit(&self, event: Event) {
        let _ = self.inner.tx.send(event.clone());
        let sinks = self.inner.sinks.read().await.clone();
        for sink in sinks {
            let event = event.clone();
            tokio::spawn(async move {
                sink.write(&event).await;
            });
        }
    }
}

/// Sink that renders events into structured log lines.
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match serde_json::to_string(event) {
                Ok(payload) => info!(event = "pool_event", payload = %payload),
                Err(_) => info!(event = "pool_event", payload = "<unserializable>"),
            }
        })
    }
}
