//! AWS Bedrock key provider.
//!
//! Secrets are `accessKeyId:secretAccessKey:region` composites. Model access
//! is discovered by sending intentionally malformed invokes: a validation
//! error proves the key can reach the model, a specific 403 proves it
//! cannot, and throttling/overload answers count as reachable.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::checker::{
    CheckerConfig, CheckerHandle, KeyProbe, ProbeAuth, ProbeClient, ProbeOutcome, ProbeRequest,
    spawn_checker,
};
use crate::events::EventHub;
use crate::family::{ModelFamily, Service, family_of};
use crate::key::{AwsLoggingStatus, Key, KeyDetail, KeyPatch};
use crate::provider::{KeyProvider, split_config_keys};
use crate::ring::{KeyPoolError, KeyRing};

const KEY_REUSE_DELAY: Duration = Duration::from_millis(250);
const RATE_LIMIT_LOCKOUT: Duration = Duration::from_millis(5000);

/// Model IDs probed for access, with the family each one unlocks.
const PROBE_MODELS: &[(&str, ModelFamily)] = &[
    ("anthropic.claude-3-5-sonnet-20240620-v1:0", ModelFamily::AwsClaude),
    ("anthropic.claude-3-sonnet-20240229-v1:0", ModelFamily::AwsClaude),
    ("anthropic.claude-3-haiku-20240307-v1:0", ModelFamily::AwsClaude),
    ("anthropic.claude-3-opus-20240229-v1:0", ModelFamily::AwsClaudeOpus),
    ("mistral.mistral-7b-instruct-v0:2", ModelFamily::AwsMistral),
    ("mistral.mixtral-8x7b-instruct-v0:1", ModelFamily::AwsMistral),
];

#[derive(Debug, Clone)]
pub struct AwsCredentialParts {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
}

/// Splits the composite secret. Returns `None` unless all three parts are
/// non-empty.
pub fn parse_aws_secret(secret: &str) -> Option<AwsCredentialParts> {
    let mut parts = secret.splitn(3, ':');
    let access_key_id = parts.next()?.trim();
    let secret_access_key = parts.next()?.trim();
    let region = parts.next()?.trim();
    if access_key_id.is_empty() || secret_access_key.is_empty() || region.is_empty() {
        return None;
    }
    Some(AwsCredentialParts {
        access_key_id: access_key_id.to_string(),
        secret_access_key: secret_access_key.to_string(),
        region: region.to_string(),
    })
}

pub struct AwsKeyProvider {
    ring: Arc<KeyRing>,
    checker: Option<CheckerHandle>,
    allow_logging: bool,
}

impl AwsKeyProvider {
    pub fn from_config(
        raw: &str,
        allow_logging: bool,
        events: EventHub,
        probe_client: Option<Arc<dyn ProbeClient>>,
    ) -> Self {
        let keys = split_config_keys(raw)
            .into_iter()
            .filter_map(|secret| {
                let parts = parse_aws_secret(&secret)?;
                Some(Key::new(
                    Service::Aws,
                    secret,
                    [ModelFamily::AwsClaude],
                    KeyDetail::Aws {
                        access_key_id: parts.access_key_id,
                        region: parts.region,
                        logging_status: AwsLoggingStatus::Unknown,
                        model_ids: BTreeSet::new(),
                        inference_profile_ids: BTreeSet::new(),
                    },
                ))
            })
            .collect();
        let ring = KeyRing::new(
            Service::Aws,
            KEY_REUSE_DELAY,
            RATE_LIMIT_LOCKOUT,
            keys,
            events,
        );
        let checker = probe_client.map(|client| {
            spawn_checker(
                ring.clone(),
                Arc::new(AwsProbe),
                client,
                CheckerConfig {
                    min_check_interval: Duration::from_secs(3 * 60 * 60),
                    batch_size: 2,
                    recurring: true,
                },
            )
        });
        Self {
            ring,
            checker,
            allow_logging,
        }
    }
}

#[async_trait]
impl KeyProvider for AwsKeyProvider {
    fn service(&self) -> Service {
        Service::Aws
    }

    fn ring(&self) -> &Arc<KeyRing> {
        &self.ring
    }

    async fn get(&self, model: &str) -> Result<Key, KeyPoolError> {
        let family =
            family_of(model).ok_or_else(|| KeyPoolError::UnknownModel(model.to_string()))?;
        let allow_logging = self.allow_logging;
        let model_owned = model.to_string();
        let tiebreak_model = model.to_string();
        let prefer_profile = move |a: &Key, b: &Key| -> std::cmp::Ordering {
            let has_profile = |key: &Key| match &key.detail {
                KeyDetail::Aws {
                    inference_profile_ids,
                    ..
                } => inference_profile_ids
                    .iter()
                    .any(|id| id.contains(&tiebreak_model)),
                _ => false,
            };
            has_profile(b).cmp(&has_profile(a))
        };
        self.ring
            .acquire(
                family,
                move |key| match &key.detail {
                    KeyDetail::Aws {
                        logging_status,
                        model_ids,
                        ..
                    } => {
                        if !allow_logging && *logging_status == AwsLoggingStatus::Enabled {
                            return false;
                        }
                        model_ids.is_empty() || model_ids.contains(&model_owned)
                    }
                    _ => false,
                },
                Some(&prefer_profile),
            )
            .await
    }

    fn wake_checker(&self) {
        if let Some(checker) = &self.checker {
            checker.wake();
        }
    }
}

struct AwsProbe;

#[derive(Deserialize)]
struct InferenceProfilesPage {
    #[serde(rename = "inferenceProfileSummaries", default)]
    summaries: Vec<InferenceProfileSummary>,
}

#[derive(Deserialize)]
struct InferenceProfileSummary {
    #[serde(rename = "inferenceProfileId")]
    id: String,
}

#[derive(Deserialize)]
struct LoggingConfigPage {
    #[serde(rename = "loggingConfig", default)]
    logging_config: Option<serde_json::Value>,
}

#[async_trait]
impl KeyProbe for AwsProbe {
    async fn probe(&self, client: &dyn ProbeClient, key: &Key) -> ProbeOutcome {
        let Some(parts) = parse_aws_secret(&key.secret) else {
            return ProbeOutcome::Invalid;
        };
        let auth = ProbeAuth::AwsSigV4 {
            access_key_id: parts.access_key_id.clone(),
            secret_access_key: parts.secret_access_key.clone(),
            region: parts.region.clone(),
            service: "bedrock",
        };
        let runtime_host = format!("bedrock-runtime.{}.amazonaws.com", parts.region);
        let control_host = format!("bedrock.{}.amazonaws.com", parts.region);

        let mut model_ids = BTreeSet::new();
        let mut families = BTreeSet::new();
        let mut saw_auth_failure = false;
        for (model_id, family) in PROBE_MODELS {
            let response = match client
                .send(
                    ProbeRequest::post(
                        format!("https://{runtime_host}/model/{model_id}/invoke"),
                        br#"{"max_tokens":-1}"#.to_vec(),
                    )
                    .header("accept", "application/json")
                    .auth(auth.clone()),
                )
                .await
            {
                Ok(response) => response,
                Err(message) => return ProbeOutcome::Network(message),
            };
            match response.status {
                // A max_tokens validation complaint means the invoke reached
                // the model; throttling and overload also prove access.
                400 if response.body_text().contains("max_tokens") => {
                    model_ids.insert(model_id.to_string());
                    families.insert(*family);
                }
                429 | 503 => {
                    model_ids.insert(model_id.to_string());
                    families.insert(*family);
                }
                403 => {
                    let body = response.body_text();
                    if body.contains("access to the model with the specified model ID") {
                        continue;
                    }
                    saw_auth_failure = true;
                    break;
                }
                400 | 404 => continue,
                status => {
                    return ProbeOutcome::Unknown(status, response.body_text());
                }
            }
        }
        if saw_auth_failure {
            return ProbeOutcome::Invalid;
        }
        if families.is_empty() {
            // Credentials work but no model is enabled; keep the key
            // disabled-equivalent by leaving its family set empty.
            return ProbeOutcome::OverQuota;
        }

        let inference_profile_ids = match client
            .send(
                ProbeRequest::get(format!(
                    "https://{control_host}/inference-profiles?maxResults=100"
                ))
                .auth(auth.clone()),
            )
            .await
        {
            Ok(response) if response.status == 200 => {
                serde_json::from_slice::<InferenceProfilesPage>(&response.body)
                    .map(|page| page.summaries.into_iter().map(|s| s.id).collect())
                    .unwrap_or_default()
            }
            _ => BTreeSet::new(),
        };

        let logging_status = match client
            .send(
                ProbeRequest::get(format!(
                    "https://{control_host}/logging/modelinvocations"
                ))
                .auth(auth),
            )
            .await
        {
            Ok(response) if response.status == 200 => {
                match serde_json::from_slice::<LoggingConfigPage>(&response.body) {
                    Ok(page) if page.logging_config.is_some() => AwsLoggingStatus::Enabled,
                    Ok(_) => AwsLoggingStatus::Disabled,
                    Err(_) => AwsLoggingStatus::Unknown,
                }
            }
            _ => AwsLoggingStatus::Unknown,
        };

        ProbeOutcome::Healthy(KeyPatch {
            model_families: Some(families),
            detail: Some(KeyDetail::Aws {
                access_key_id: parts.access_key_id,
                region: parts.region,
                logging_status,
                model_ids,
                inference_profile_ids,
            }),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_secret_parses_into_three_parts() {
        let parts = parse_aws_secret("AKIAEXAMPLE:abc/def:us-east-1").unwrap();
        assert_eq!(parts.access_key_id, "AKIAEXAMPLE");
        assert_eq!(parts.secret_access_key, "abc/def");
        assert_eq!(parts.region, "us-east-1");
        assert!(parse_aws_secret("missing:region").is_none());
        assert!(parse_aws_secret("a::c").is_none());
    }
}
