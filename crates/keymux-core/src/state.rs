//! Shared process state assembled at bootstrap.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use keymux_common::ProxyConfig;
use keymux_keys::{EventHub, KeyPool, LogEventSink, Service};
use keymux_queue::{QueueConfig, RequestQueue};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::gcp_oauth::GcpTokenBroker;
use crate::preprocess::{ContentFilter, PreprocessCtx, UserQuotas};
use crate::upstream::{SigningProbeClient, UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};

/// Models listings are rebuilt at most once per minute per provider.
pub const MODELS_CACHE_TTL_MS: u64 = 60_000;

pub struct ProxyState {
    pub config: ArcSwap<ProxyConfig>,
    pub pool: Arc<KeyPool>,
    pub queue: Arc<RequestQueue>,
    pub client: Arc<dyn UpstreamClient>,
    pub gcp_tokens: Arc<GcpTokenBroker>,
    pub preprocess: PreprocessCtx,
    pub events: EventHub,
    pub models_cache: Mutex<HashMap<Service, (u64, JsonValue)>>,
}

impl ProxyState {
    /// Production bootstrap: wreq transport, probing checkers, scheduler
    /// loops started.
    pub async fn bootstrap(config: ProxyConfig) -> Result<Arc<Self>, crate::error::ProxyError> {
        let client: Arc<dyn UpstreamClient> = Arc::new(
            WreqUpstreamClient::new(UpstreamClientConfig {
                proxy: config.proxy.clone(),
                ..Default::default()
            })
            .map_err(|err| crate::error::ProxyError::upstream_fatal(err.message.clone()))?,
        );
        Ok(Self::assemble(config, client, None, true).await)
    }

    /// Test bootstrap: injected transport, no background probing.
    pub async fn for_tests(
        config: ProxyConfig,
        client: Arc<dyn UpstreamClient>,
    ) -> Arc<Self> {
        Self::assemble(config, client, None, false).await
    }

    pub async fn assemble(
        config: ProxyConfig,
        client: Arc<dyn UpstreamClient>,
        filter: Option<Arc<dyn ContentFilter>>,
        with_checkers: bool,
    ) -> Arc<Self> {
        let events = EventHub::new(256);
        events.add_sink(Arc::new(LogEventSink)).await;
        let gcp_tokens = Arc::new(GcpTokenBroker::new());

        let probe_client = with_checkers.then(|| {
            Arc::new(SigningProbeClient::new(client.clone(), gcp_tokens.clone()))
                as Arc<dyn keymux_keys::ProbeClient>
        });
        let pool = Arc::new(KeyPool::from_config(&config, events.clone(), probe_client));

        let queue = RequestQueue::new(
            QueueConfig {
                user_concurrency_limit: config.user_concurrency_limit,
                load_threshold: config.load_threshold,
            },
            events.clone(),
        );
        queue.spawn(pool.clone());

        let preprocess = PreprocessCtx::new(Arc::new(UserQuotas::new()), filter);

        Arc::new(Self {
            config: ArcSwap::new(Arc::new(config)),
            pool,
            queue,
            client,
            gcp_tokens,
            preprocess,
            events,
            models_cache: Mutex::new(HashMap::new()),
        })
    }
}
