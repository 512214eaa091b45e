//! Per-attempt, reversible request mutations.
//!
//! Every change here goes through the `RequestManager`, so a retryable
//! failure can revert to the transformed-but-unauthenticated state and the
//! next attempt starts clean with a fresh key.

use std::collections::BTreeMap;

use bytes::Bytes;
use keymux_keys::providers::aws::parse_aws_secret;
use keymux_keys::providers::azure::{parse_azure_secret, API_VERSION as AZURE_API_VERSION};
use keymux_keys::providers::gcp::parse_gcp_secret;
use keymux_keys::{KeyDetail, KeyPatch, KeyPool, KeyPoolError, Service};
use keymux_protocol::ApiFormat;

use crate::error::{ErrorKind, ProxyError};
use crate::gcp_oauth::GcpTokenBroker;
use crate::manager::RequestManager;
use crate::request::SignedRequest;
use crate::sigv4::{SigV4Signer, SigV4Timestamp};
use crate::upstream::UpstreamClient;

/// Client-identity, CORS/fetch and infrastructure headers never forwarded
/// upstream.
const STRIPPED_HEADERS: &[&str] = &[
    "host",
    "origin",
    "referer",
    "authorization",
    "x-api-key",
    "api-key",
    "cookie",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-real-ip",
    "cf-connecting-ip",
    "cf-ipcountry",
    "cf-ray",
    "cf-visitor",
    "cdn-loop",
    "forwarded",
    "via",
    "true-client-ip",
];

/// Threshold past which Anthropic requests opt into the long-output beta.
const ANTHROPIC_LONG_OUTPUT_TOKENS: u64 = 4096;
const ANTHROPIC_LONG_OUTPUT_BETA: &str = "max-tokens-3-5-sonnet-2024-07-15";

pub struct MutateCtx<'a> {
    pub pool: &'a KeyPool,
    pub gcp_tokens: &'a GcpTokenBroker,
    pub client: &'a dyn UpstreamClient,
}

/// Runs the full mutator chain: strip → auth/sign → finalize.
pub async fn apply_mutators(
    manager: &mut RequestManager,
    ctx: &MutateCtx<'_>,
) -> Result<(), ProxyError> {
    strip_headers(manager);
    assign_key(manager, ctx).await?;
    apply_auth(manager, ctx).await?;
    finalize_body(manager)?;
    Ok(())
}

fn strip_headers(manager: &mut RequestManager) {
    for name in STRIPPED_HEADERS {
        manager.remove_header(name);
    }
    let sec_headers: Vec<String> = manager
        .request()
        .headers
        .iter()
        .filter(|(name, _)| name.to_ascii_lowercase().starts_with("sec-"))
        .map(|(name, _)| name.clone())
        .collect();
    for name in sec_headers {
        manager.remove_header(&name);
    }
}

async fn assign_key(manager: &mut RequestManager, ctx: &MutateCtx<'_>) -> Result<(), ProxyError> {
    let model = manager.request().model.clone();
    let key = ctx.pool.get(&model).await.map_err(|err| match err {
        KeyPoolError::NoKeyAvailable(family) => ProxyError::new(
            ErrorKind::NoKeyAvailable,
            format!("no key currently available for family {family}"),
        ),
        KeyPoolError::UnknownModel(model) => {
            ProxyError::bad_request(format!("unknown model: {model}"))
        }
        KeyPoolError::ServiceNotConfigured(service) => {
            ProxyError::forbidden(format!("provider {service} is not enabled"))
        }
    })?;
    manager.set_key(key);
    Ok(())
}

async fn apply_auth(manager: &mut RequestManager, ctx: &MutateCtx<'_>) -> Result<(), ProxyError> {
    let Some(key) = manager.request().key.clone() else {
        return Err(ProxyError::upstream_fatal("auth mutator ran before key assignment"));
    };
    match key.service {
        Service::OpenAi => {
            manager.set_header("authorization", format!("Bearer {}", key.secret));
            if let KeyDetail::OpenAi {
                organization_id: Some(org),
                ..
            } = &key.detail
            {
                manager.set_header("openai-organization", org.clone());
            }
            let path = match manager.request().inbound_format {
                ApiFormat::OpenAiImage => "/v1/images/generations",
                _ => "/v1/chat/completions",
            };
            manager.set_path(format!("https://api.openai.com{path}"));
        }
        Service::Anthropic => {
            manager.set_header("x-api-key", key.secret.clone());
            manager.set_header("anthropic-version", keymux_protocol::anthropic::ANTHROPIC_VERSION);
            if manager.request().output_tokens > ANTHROPIC_LONG_OUTPUT_TOKENS {
                manager.set_header("anthropic-beta", ANTHROPIC_LONG_OUTPUT_BETA);
            }
            let path = match manager.request().outbound_format {
                ApiFormat::AnthropicText => "/v1/complete",
                _ => "/v1/messages",
            };
            ensure_anthropic_preamble(manager, &key);
            manager.set_path(format!("https://api.anthropic.com{path}"));
        }
        Service::Aws => sign_aws(manager, &key)?,
        Service::Gcp => sign_gcp(manager, &key, ctx).await?,
        Service::Azure => {
            let parts = parse_azure_secret(&key.secret).ok_or_else(|| {
                ProxyError::upstream_fatal("azure credential failed to parse")
            })?;
            manager.set_header("api-key", parts.api_key);
            let endpoint = match manager.request().inbound_format {
                ApiFormat::OpenAiImage => "images/generations",
                _ => "chat/completions",
            };
            manager.set_path(format!(
                "https://{}.openai.azure.com/openai/deployments/{}/{}?api-version={}",
                parts.resource_name, parts.deployment_id, endpoint, AZURE_API_VERSION
            ));
        }
        Service::GoogleAi => {
            let action = if manager.request().streaming {
                "streamGenerateContent?alt=sse&"
            } else {
                "generateContent?"
            };
            let model = manager.request().model.clone();
            manager.set_path(format!(
                "https://generativelanguage.googleapis.com/v1beta/models/{model}:{action}key={}",
                key.secret
            ));
        }
        Service::Mistral => {
            manager.set_header("authorization", format!("Bearer {}", key.secret));
            manager.set_path("https://api.mistral.ai/v1/chat/completions");
        }
    }
    Ok(())
}

/// Some Anthropic keys reject legacy prompts that do not open with the
/// Human turn; prepend it for those keys only.
fn ensure_anthropic_preamble(manager: &mut RequestManager, key: &keymux_keys::Key) {
    let KeyDetail::Anthropic {
        requires_preamble: true,
        ..
    } = &key.detail
    else {
        return;
    };
    if manager.request().outbound_format != ApiFormat::AnthropicText {
        return;
    }
    let Some(prompt) = manager.request().body.get("prompt").and_then(|p| p.as_str()) else {
        return;
    };
    if prompt.starts_with(keymux_protocol::anthropic::HUMAN_PREAMBLE) {
        return;
    }
    let mut body = manager.request().body.clone();
    body["prompt"] = serde_json::Value::String(format!(
        "{} {prompt}",
        keymux_protocol::anthropic::HUMAN_PREAMBLE
    ));
    manager.replace_body(body);
}

fn sign_aws(manager: &mut RequestManager, key: &keymux_keys::Key) -> Result<(), ProxyError> {
    let parts = parse_aws_secret(&key.secret)
        .ok_or_else(|| ProxyError::upstream_fatal("aws credential failed to parse"))?;
    let request = manager.request();
    let host = format!("bedrock-runtime.{}.amazonaws.com", parts.region);
    let path = format!("/model/{}/invoke{}", request.model, if request.streaming {
        "-with-response-stream"
    } else {
        ""
    });
    let body = serde_json::to_vec(&request.body)
        .map_err(|err| ProxyError::upstream_fatal(format!("body serialize: {err}")))?;

    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    headers.insert("accept".to_string(), accept_for_stream(request.streaming));
    let signer = SigV4Signer::new(
        parts.access_key_id,
        parts.secret_access_key,
        parts.region,
        "bedrock",
    );
    let signed = signer.sign(
        "POST",
        &host,
        &path,
        &headers,
        &body,
        SigV4Timestamp::now()?,
    )?;

    let mut envelope_headers: Vec<(String, String)> =
        headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    envelope_headers.extend(signed.into_pairs());
    manager.set_signed_request(SignedRequest {
        method: "POST".to_string(),
        hostname: host.clone(),
        path: path.clone(),
        headers: envelope_headers,
        body: Bytes::from(body),
    });
    manager.set_path(format!("https://{host}{path}"));
    Ok(())
}

fn accept_for_stream(streaming: bool) -> String {
    if streaming {
        "application/vnd.amazon.eventstream".to_string()
    } else {
        "application/json".to_string()
    }
}

async fn sign_gcp(
    manager: &mut RequestManager,
    key: &keymux_keys::Key,
    ctx: &MutateCtx<'_>,
) -> Result<(), ProxyError> {
    let parts = parse_gcp_secret(&key.secret)
        .ok_or_else(|| ProxyError::upstream_fatal("gcp credential failed to parse"))?;
    let token = ctx
        .gcp_tokens
        .access_token(ctx.client, &parts.client_email, &parts.private_key_b64)
        .await?;

    // Persist the refreshed token onto the key record.
    if let KeyDetail::Gcp {
        project_id,
        client_email,
        region,
        sonnet_enabled,
        haiku_enabled,
        sonnet35_enabled,
        ..
    } = &key.detail
    {
        let expires_at = ctx
            .gcp_tokens
            .cached_expiry(client_email)
            .await
            .unwrap_or(0);
        ctx.pool
            .update(
                Service::Gcp,
                &key.hash,
                KeyPatch {
                    detail: Some(KeyDetail::Gcp {
                        project_id: project_id.clone(),
                        client_email: client_email.clone(),
                        region: region.clone(),
                        access_token: token.clone(),
                        access_token_expires_at: expires_at,
                        sonnet_enabled: *sonnet_enabled,
                        haiku_enabled: *haiku_enabled,
                        sonnet35_enabled: *sonnet35_enabled,
                    }),
                    ..Default::default()
                },
            )
            .await;
    }

    let mut body = manager.request().body.clone();
    body["anthropic_version"] =
        serde_json::Value::String("vertex-2023-10-16".to_string());
    if let Some(map) = body.as_object_mut() {
        map.remove("model");
    }
    manager.replace_body(body.clone());

    let model = manager
        .request()
        .model
        .strip_prefix("gcp/")
        .unwrap_or(&manager.request().model)
        .to_string();
    let host = format!("{}-aiplatform.googleapis.com", parts.region);
    let action = if manager.request().streaming {
        "streamRawPredict"
    } else {
        "rawPredict"
    };
    let path = format!(
        "/v1/projects/{}/locations/{}/publishers/anthropic/models/{}:{}",
        parts.project_id, parts.region, model, action
    );
    let bytes = serde_json::to_vec(&body)
        .map_err(|err| ProxyError::upstream_fatal(format!("body serialize: {err}")))?;
    manager.set_signed_request(SignedRequest {
        method: "POST".to_string(),
        hostname: host.clone(),
        path: path.clone(),
        headers: vec![
            ("authorization".to_string(), format!("Bearer {token}")),
            ("content-type".to_string(), "application/json".to_string()),
        ],
        body: Bytes::from(bytes),
    });
    manager.set_path(format!("https://{host}{path}"));
    Ok(())
}

/// Serializes the (possibly signed) body and stamps framing headers. For
/// signed requests the envelope body is authoritative; the finalizer only
/// reconciles lengths.
fn finalize_body(manager: &mut RequestManager) -> Result<(), ProxyError> {
    let bytes = match &manager.request().signed {
        Some(signed) => signed.body.clone(),
        None => Bytes::from(
            serde_json::to_vec(&manager.request().body)
                .map_err(|err| ProxyError::upstream_fatal(format!("body serialize: {err}")))?,
        ),
    };
    manager.set_header("content-type", "application/json");
    manager.set_header("content-length", bytes.len().to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ProxyRequest;
    use keymux_keys::ModelFamily;

    fn manager_with_headers() -> RequestManager {
        RequestManager::new(ProxyRequest {
            id: "r".to_string(),
            identity: "u".to_string(),
            inbound_format: ApiFormat::OpenAiChat,
            outbound_format: ApiFormat::OpenAiChat,
            service: Service::OpenAi,
            model: "gpt-4o-2024-05-13".to_string(),
            model_family: ModelFamily::Gpt4o,
            body: serde_json::json!({"model": "gpt-4o-2024-05-13"}),
            headers: vec![
                ("origin".to_string(), "https://a.example".to_string()),
                ("sec-fetch-mode".to_string(), "cors".to_string()),
                ("x-forwarded-for".to_string(), "10.0.0.1".to_string()),
                ("accept".to_string(), "application/json".to_string()),
            ],
            path: String::new(),
            key: None,
            signed: None,
            streaming: false,
            start_time: 0,
            queue_out_time: 0,
            retry_count: 0,
            prompt_tokens: 0,
            output_tokens: 0,
        })
    }

    #[test]
    fn strip_removes_identity_and_fetch_headers_reversibly() {
        let mut manager = manager_with_headers();
        strip_headers(&mut manager);
        assert!(manager.request().header("origin").is_none());
        assert!(manager.request().header("sec-fetch-mode").is_none());
        assert!(manager.request().header("x-forwarded-for").is_none());
        assert_eq!(manager.request().header("accept"), Some("application/json"));

        manager.revert();
        assert_eq!(
            manager.request().header("origin"),
            Some("https://a.example")
        );
        assert_eq!(manager.request().header("sec-fetch-mode"), Some("cors"));
    }

    #[test]
    fn finalize_sets_framing_headers() {
        let mut manager = manager_with_headers();
        finalize_body(&mut manager).unwrap();
        let length: usize = manager
            .request()
            .header("content-length")
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(
            length,
            serde_json::to_vec(&manager.request().body).unwrap().len()
        );
    }
}
