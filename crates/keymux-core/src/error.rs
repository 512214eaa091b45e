//! Pipeline error taxonomy.
//!
//! Retryable failures are a distinguished kind rather than an exception
//! thrown through frames: the response handler is the single boundary that
//! converts `RetryableUpstream` into a revert + re-enqueue.

use http::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Client schema violation; surfaced immediately.
    BadRequest,
    /// Policy rejection (blocked origin, disallowed family).
    Forbidden,
    /// Queue concurrency limit for this identity.
    TooManyRequests,
    /// Every enabled credential in the family is exhausted.
    NoKeyAvailable,
    /// Transient upstream signal; triggers revert + re-enqueue.
    RetryableUpstream,
    /// Credential revoked upstream; disable + revoke, surface as transient.
    KeyInvalid,
    /// Credential quota exhausted; disable without revoking.
    KeyQuotaExceeded,
    /// Non-retryable, non-client upstream failure.
    UpstreamFatal,
    /// Client went away; purge quietly.
    ClientAborted,
}

#[derive(Debug, Clone)]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProxyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn upstream_fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamFatal, message)
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RetryableUpstream, message)
    }

    pub fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::NoKeyAvailable => StatusCode::PAYMENT_REQUIRED,
            ErrorKind::RetryableUpstream => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::KeyInvalid => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::KeyQuotaExceeded => StatusCode::PAYMENT_REQUIRED,
            ErrorKind::UpstreamFatal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::ClientAborted => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire label rendered into spoofed completion envelopes.
    pub fn label(&self) -> &'static str {
        match self.kind {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::TooManyRequests => "too_many_requests",
            ErrorKind::NoKeyAvailable => "no_key_available",
            ErrorKind::RetryableUpstream => "upstream_retryable",
            ErrorKind::KeyInvalid => "key_invalid",
            ErrorKind::KeyQuotaExceeded => "key_quota_exceeded",
            ErrorKind::UpstreamFatal => "upstream_error",
            ErrorKind::ClientAborted => "client_aborted",
        }
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.label(), self.message)
    }
}

impl std::error::Error for ProxyError {}

/// Strips resolved hostnames out of transport error text so DNS failures do
/// not leak upstream topology to clients.
pub fn redact_hostnames(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for token in message.split_whitespace() {
        let bare = token.trim_matches(|c: char| !c.is_ascii_alphanumeric());
        if bare.contains('.') && bare.parse::<f64>().is_err() && bare.chars().any(|c| c.is_ascii_alphabetic()) {
            out.push_str("<redacted>");
        } else {
            out.push_str(token);
        }
        out.push(' ');
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostnames_are_redacted_from_dns_errors() {
        let redacted =
            redact_hostnames("dns error: failed to lookup api.openai.com: Name not known");
        assert!(!redacted.contains("api.openai.com"));
        assert!(redacted.contains("<redacted>"));
    }

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(
            ProxyError::new(ErrorKind::NoKeyAvailable, "").status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            ProxyError::bad_request("x").status(),
            StatusCode::BAD_REQUEST
        );
    }
}
