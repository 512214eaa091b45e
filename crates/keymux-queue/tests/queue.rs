use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use keymux_common::ProxyConfig;
use keymux_keys::provider::KeyProvider;
use keymux_keys::{EventHub, KeyPool, ModelFamily, Service};
use keymux_queue::{Dequeue, EnqueueError, QueueConfig, RequestQueue, Ticket};
use tokio::time::timeout;

const SONNET: &str = "claude-3-5-sonnet-20240620";
const MISTRAL_SMALL: &str = "mistral-small-2402";

fn ticket(id: &str, identity: &str, family: ModelFamily) -> Ticket {
    Ticket {
        id: id.to_string(),
        identity: identity.to_string(),
        family,
        prompt_tokens: 10,
        output_tokens: 10,
        streaming: false,
    }
}

fn pool_with(providers: &[(&str, &str)]) -> Arc<KeyPool> {
    let config = ProxyConfig {
        credentials: providers
            .iter()
            .map(|(tag, keys)| (tag.to_string(), keys.to_string()))
            .collect::<HashMap<_, _>>(),
        ..Default::default()
    };
    Arc::new(KeyPool::from_config(&config, EventHub::new(16), None))
}

fn queue(limit: usize, load_threshold: usize) -> Arc<RequestQueue> {
    RequestQueue::new(
        QueueConfig {
            user_concurrency_limit: limit,
            load_threshold,
        },
        EventHub::new(16),
    )
}

#[tokio::test]
async fn identity_concurrency_limit_rejects_second_request() {
    let queue = queue(1, 100);
    let _first = queue
        .enqueue(ticket("a", "user-1", ModelFamily::Claude))
        .await
        .unwrap();
    let second = queue
        .enqueue(ticket("b", "user-1", ModelFamily::Claude))
        .await;
    assert!(matches!(second, Err(EnqueueError::TooManyRequests)));

    // A different identity is unaffected.
    assert!(queue
        .enqueue(ticket("c", "user-2", ModelFamily::Claude))
        .await
        .is_ok());
}

#[tokio::test]
async fn load_threshold_requires_streaming() {
    let queue = queue(10, 1);
    let mut streaming = ticket("a", "u1", ModelFamily::Claude);
    streaming.streaming = true;
    queue.enqueue(streaming).await.unwrap();

    let blocking = queue.enqueue(ticket("b", "u2", ModelFamily::Claude)).await;
    assert!(matches!(blocking, Err(EnqueueError::StreamRequired)));

    let mut streaming2 = ticket("c", "u3", ModelFamily::Claude);
    streaming2.streaming = true;
    assert!(queue.enqueue(streaming2).await.is_ok());
}

#[tokio::test]
async fn rate_limited_family_does_not_block_other_partitions() {
    let pool = pool_with(&[
        ("anthropic", "sk-ant-aaaa,sk-ant-bbbb"),
        ("mistral", "mk-aaaa"),
    ]);
    // Saturate every anthropic key.
    let anthropic = pool.provider(Service::Anthropic).unwrap();
    for key in anthropic.list().await {
        anthropic.mark_rate_limited(&key.hash).await;
    }
    assert!(pool.get_lockout_period(ModelFamily::Claude).await > Duration::ZERO);
    assert_eq!(
        pool.get_lockout_period(ModelFamily::MistralSmall).await,
        Duration::ZERO
    );

    let queue = queue(10, 100);
    queue.spawn(pool.clone());

    let claude = queue
        .enqueue(ticket("claude-1", "u1", ModelFamily::Claude))
        .await
        .unwrap();
    let mistral = queue
        .enqueue(ticket("mistral-1", "u2", ModelFamily::MistralSmall))
        .await
        .unwrap();

    // The mistral request dispatches within a tick or two.
    let turn = timeout(Duration::from_millis(500), mistral.rx)
        .await
        .expect("mistral request should dispatch")
        .unwrap();
    assert_eq!(turn, Dequeue::Ready);

    // The claude request is still parked.
    assert!(
        timeout(Duration::from_millis(200), claude.rx).await.is_err(),
        "claude partition should stay locked out"
    );
    assert_eq!(queue.partition_len(ModelFamily::Claude).await, 1);
}

#[tokio::test]
async fn cost_weighted_dispatch_prefers_cheap_requests() {
    let pool = pool_with(&[("mistral", "mk-aaaa")]);
    let queue = queue(10, 100);

    let mut heavy = ticket("heavy", "u1", ModelFamily::MistralSmall);
    heavy.prompt_tokens = 100_000;
    heavy.output_tokens = 100_000;
    let heavy_handle = queue.enqueue(heavy).await.unwrap();
    let light_handle = queue
        .enqueue(ticket("light", "u2", ModelFamily::MistralSmall))
        .await
        .unwrap();

    // Scheduler started after both are queued so the first tick sees both.
    queue.spawn(pool.clone());

    let first = timeout(Duration::from_millis(500), light_handle.rx)
        .await
        .expect("light request should dispatch first")
        .unwrap();
    assert_eq!(first, Dequeue::Ready);
    let second = timeout(Duration::from_millis(500), heavy_handle.rx)
        .await
        .expect("heavy request should follow")
        .unwrap();
    assert_eq!(second, Dequeue::Ready);
}

#[tokio::test]
async fn removed_request_is_not_dispatched() {
    let pool = pool_with(&[("mistral", "mk-aaaa")]);
    let queue = queue(10, 100);

    let handle = queue
        .enqueue(ticket("gone", "u1", ModelFamily::MistralSmall))
        .await
        .unwrap();
    assert!(queue.remove("gone").await);
    assert_eq!(queue.len().await, 0);

    queue.spawn(pool.clone());
    // The oneshot is dropped with the entry; the receiver errors instead of
    // ever firing.
    assert!(handle.rx.await.is_err());

    // Removing twice reports the entry already gone.
    assert!(!queue.remove("gone").await);
}

#[tokio::test]
async fn reenqueue_keeps_identity_slot_and_bumps_retry_count() {
    let queue = queue(1, 100);
    let original = ticket("r1", "user-1", ModelFamily::Claude);
    let handle = queue.enqueue(original.clone()).await.unwrap();
    assert_eq!(handle.retry_count, 0);
    queue.remove("r1").await;

    let retried = queue.reenqueue(original, 0).await;
    assert_eq!(retried.retry_count, 1);
    assert_eq!(queue.len().await, 1);
}
