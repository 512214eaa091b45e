//! Uniform upstream error classification.
//!
//! One table for all providers; provider-specific signals (error codes,
//! `x-amzn-errortype`) feed the same outcome set. The response handler is
//! the only consumer.

use keymux_keys::Service;

use crate::error::{ErrorKind, ProxyError};

/// What the response handler should do with a non-2xx upstream answer.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamOutcome {
    /// Mark the key rate-limited, revert and re-enqueue.
    RateLimitRetry,
    /// Patch the key (preamble / multimodality), revert and re-enqueue.
    KeyFlagRetry(KeyFlag),
    /// Disable the key; optionally revoke; surface the given error.
    DisableKey { revoke: bool, error: ProxyError },
    /// Surface to the client without touching the key.
    Surface(ProxyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFlag {
    RequiresPreamble,
    NoMultimodality,
}

pub struct UpstreamFailure<'a> {
    pub service: Service,
    pub status: u16,
    /// `x-amzn-errortype` when present (Bedrock).
    pub amzn_errortype: Option<&'a str>,
    pub body: &'a str,
}

pub fn classify(failure: &UpstreamFailure<'_>) -> UpstreamOutcome {
    let body = failure.body;
    let amzn = failure.amzn_errortype.unwrap_or("");

    match failure.status {
        400 => {
            if contains_any(body, &["content_filter", "content_policy", "blocked by our content"])
            {
                // Refund the attempt: the key is fine, the prompt is not.
                return UpstreamOutcome::Surface(ProxyError::bad_request(
                    "prompt rejected by upstream content filter",
                ));
            }
            if contains_any(body, &["billing", "payment", "insufficient_quota"]) {
                return UpstreamOutcome::DisableKey {
                    revoke: false,
                    error: ProxyError::new(
                        ErrorKind::KeyQuotaExceeded,
                        "upstream credential exhausted",
                    ),
                };
            }
            if body.contains("\\n\\nHuman:") || body.contains("Human:") && body.contains("prompt")
            {
                return UpstreamOutcome::KeyFlagRetry(KeyFlag::RequiresPreamble);
            }
            if contains_any(body, &["image", "vision", "multimodal"])
                && contains_any(body, &["not allowed", "not supported", "does not support"])
            {
                return UpstreamOutcome::KeyFlagRetry(KeyFlag::NoMultimodality);
            }
            UpstreamOutcome::Surface(ProxyError::bad_request(format!(
                "upstream rejected request: {}",
                truncate(body, 300)
            )))
        }
        401 => UpstreamOutcome::DisableKey {
            revoke: true,
            error: ProxyError::new(ErrorKind::KeyInvalid, "assigned key was revoked upstream"),
        },
        403 => {
            if contains_any(
                body,
                &[
                    "access to the model",
                    "model is not accessible",
                    "does not have access to model",
                ],
            ) {
                return UpstreamOutcome::Surface(ProxyError::forbidden(
                    "assigned key lacks access to this model",
                ));
            }
            UpstreamOutcome::DisableKey {
                revoke: true,
                error: ProxyError::new(ErrorKind::KeyInvalid, "assigned key was revoked upstream"),
            }
        }
        404 => UpstreamOutcome::Surface(ProxyError::bad_request(
            "model not found for the assigned key",
        )),
        429 => {
            if amzn.contains("ThrottlingException") {
                return UpstreamOutcome::RateLimitRetry;
            }
            if contains_any(body, &["daily", "per day", "DAY"]) {
                return UpstreamOutcome::Surface(ProxyError::new(
                    ErrorKind::UpstreamFatal,
                    "upstream daily quota reached for this model",
                ));
            }
            if contains_any(body, &["quota", "billing", "credit", "exceeded your current"]) {
                return UpstreamOutcome::DisableKey {
                    revoke: false,
                    error: ProxyError::new(
                        ErrorKind::KeyQuotaExceeded,
                        "upstream credential exhausted",
                    ),
                };
            }
            UpstreamOutcome::RateLimitRetry
        }
        503 => UpstreamOutcome::Surface(ProxyError::new(
            ErrorKind::UpstreamFatal,
            "upstream is overloaded, try again later",
        )),
        status if (500..600).contains(&status) => UpstreamOutcome::Surface(ProxyError::new(
            ErrorKind::UpstreamFatal,
            format!("upstream error {status}"),
        )),
        status => UpstreamOutcome::Surface(ProxyError::new(
            ErrorKind::UpstreamFatal,
            format!("unexpected upstream status {status}: {}", truncate(body, 300)),
        )),
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(status: u16, body: &str) -> UpstreamOutcome {
        classify(&UpstreamFailure {
            service: Service::OpenAi,
            status,
            amzn_errortype: None,
            body,
        })
    }

    #[test]
    fn plain_429_is_a_rate_limit_retry() {
        assert_eq!(
            failure(429, r#"{"error":{"message":"Rate limit reached"}}"#),
            UpstreamOutcome::RateLimitRetry
        );
    }

    #[test]
    fn quota_429_disables_without_revoking() {
        match failure(429, r#"{"error":{"code":"insufficient_quota","message":"quota"}}"#) {
            UpstreamOutcome::DisableKey { revoke, error } => {
                assert!(!revoke);
                assert_eq!(error.kind, ErrorKind::KeyQuotaExceeded);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn daily_quota_surfaces_without_retry() {
        assert!(matches!(
            failure(429, "Quota exceeded for requests per day"),
            UpstreamOutcome::Surface(_)
        ));
    }

    #[test]
    fn unauthorized_revokes() {
        assert!(matches!(
            failure(401, "invalid api key"),
            UpstreamOutcome::DisableKey { revoke: true, .. }
        ));
    }

    #[test]
    fn model_access_403_surfaces_without_disabling() {
        assert!(matches!(
            failure(
                403,
                "You don't have access to the model with the specified model ID."
            ),
            UpstreamOutcome::Surface(_)
        ));
    }

    #[test]
    fn preamble_400_flags_the_key() {
        assert_eq!(
            failure(400, r#"prompt must start with "\n\nHuman:" turn"#),
            UpstreamOutcome::KeyFlagRetry(KeyFlag::RequiresPreamble)
        );
    }

    #[test]
    fn bedrock_throttle_header_drives_retry() {
        let outcome = classify(&UpstreamFailure {
            service: Service::Aws,
            status: 429,
            amzn_errortype: Some("ThrottlingException:http://internal"),
            body: "",
        });
        assert_eq!(outcome, UpstreamOutcome::RateLimitRetry);
    }

    #[test]
    fn content_filter_400_surfaces_as_client_error() {
        assert!(matches!(
            failure(400, r#"{"error":{"code":"content_filter"}}"#),
            UpstreamOutcome::Surface(_)
        ));
    }
}
