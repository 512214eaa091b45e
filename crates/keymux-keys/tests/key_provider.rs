use std::time::Duration;

use keymux_keys::provider::KeyProvider;
use keymux_keys::providers::{AnthropicKeyProvider, MistralKeyProvider};
use keymux_keys::{now_ms, EventHub, KeyPoolError, ModelFamily};

const SONNET: &str = "claude-3-5-sonnet-20240620";

fn anthropic_two_keys() -> AnthropicKeyProvider {
    AnthropicKeyProvider::from_config("sk-ant-aaaa,sk-ant-bbbb", EventHub::new(16), None)
}

#[tokio::test]
async fn get_returns_enabled_key_and_throttles_it() {
    let provider = anthropic_two_keys();
    let before = now_ms();
    let key = provider.get(SONNET).await.unwrap();

    assert!(!key.is_disabled);
    assert!(key.serves_family(ModelFamily::Claude));
    // Post-selection throttle: the key is locked out for at least the reuse
    // delay so it is not immediately reassigned.
    assert!(key.rate_limited_until >= before + 500);
    assert!(key.last_used >= before);
}

#[tokio::test]
async fn get_rotates_to_least_recently_used_key() {
    let provider = anthropic_two_keys();
    let first = provider.get(SONNET).await.unwrap();
    let second = provider.get(SONNET).await.unwrap();
    assert_ne!(first.hash, second.hash);
}

#[tokio::test]
async fn get_fails_when_every_key_is_disabled() {
    let provider = anthropic_two_keys();
    for key in provider.list().await {
        provider.disable(&key.hash, false).await;
    }
    match provider.get(SONNET).await {
        Err(KeyPoolError::NoKeyAvailable(family)) => assert_eq!(family, ModelFamily::Claude),
        other => panic!("expected NoKeyAvailable, got {other:?}"),
    }
}

#[tokio::test]
async fn lockout_period_is_zero_iff_any_enabled_key_is_usable() {
    let provider = anthropic_two_keys();
    assert_eq!(
        provider.get_lockout_period(ModelFamily::Claude).await,
        Duration::ZERO
    );

    let keys = provider.list().await;
    provider.mark_rate_limited(&keys[0].hash).await;
    // One key still free.
    assert_eq!(
        provider.get_lockout_period(ModelFamily::Claude).await,
        Duration::ZERO
    );

    provider.mark_rate_limited(&keys[1].hash).await;
    let lockout = provider.get_lockout_period(ModelFamily::Claude).await;
    assert!(lockout > Duration::ZERO);
    assert!(lockout <= Duration::from_millis(2000));
}

#[tokio::test]
async fn lockout_period_is_zero_for_family_with_no_enabled_keys() {
    let provider = anthropic_two_keys();
    for key in provider.list().await {
        provider.disable(&key.hash, true).await;
    }
    assert_eq!(
        provider.get_lockout_period(ModelFamily::Claude).await,
        Duration::ZERO
    );
}

#[tokio::test]
async fn disable_is_idempotent_and_revoke_sticks() {
    let provider = anthropic_two_keys();
    let hash = provider.list().await[0].hash.clone();

    provider.disable(&hash, false).await;
    provider.disable(&hash, false).await;
    let key = provider
        .list()
        .await
        .into_iter()
        .find(|key| key.hash == hash)
        .unwrap();
    assert!(key.is_disabled);
    assert!(!key.is_revoked);

    provider.disable(&hash, true).await;
    let key = provider
        .list()
        .await
        .into_iter()
        .find(|key| key.hash == hash)
        .unwrap();
    assert!(key.is_revoked);
    assert!(key.is_disabled);
}

#[tokio::test]
async fn mark_rate_limited_sets_the_window() {
    let provider = anthropic_two_keys();
    let hash = provider.list().await[0].hash.clone();
    let before = now_ms();
    provider.mark_rate_limited(&hash).await;

    let key = provider
        .list()
        .await
        .into_iter()
        .find(|key| key.hash == hash)
        .unwrap();
    assert!(key.rate_limited_at >= before);
    assert_eq!(key.rate_limited_until, key.rate_limited_at + 2000);
}

#[tokio::test]
async fn usage_accounting_tracks_prompts_and_family_tokens() {
    let provider = anthropic_two_keys();
    let hash = provider.list().await[0].hash.clone();
    provider.increment_usage(&hash, SONNET, 120).await;
    provider.increment_usage(&hash, SONNET, 30).await;

    let key = provider
        .list()
        .await
        .into_iter()
        .find(|key| key.hash == hash)
        .unwrap();
    assert_eq!(key.prompt_count, 2);
    assert_eq!(key.token_usage.get(&ModelFamily::Claude), Some(&150));
}

#[tokio::test]
async fn recheck_clears_disabled_and_checked_state() {
    let provider = anthropic_two_keys();
    let hash = provider.list().await[0].hash.clone();
    provider.disable(&hash, true).await;
    provider.recheck().await;

    let key = provider
        .list()
        .await
        .into_iter()
        .find(|key| key.hash == hash)
        .unwrap();
    assert!(!key.is_disabled);
    assert!(!key.is_revoked);
    assert_eq!(key.last_checked, 0);
}

#[tokio::test]
async fn listing_never_exposes_secret_material() {
    let provider = MistralKeyProvider::from_config("mk-secret-1,mk-secret-2", EventHub::new(16));
    for key in provider.list().await {
        assert!(key.secret.is_empty());
        assert!(!key.hash.contains("mk-secret"));
    }
}
