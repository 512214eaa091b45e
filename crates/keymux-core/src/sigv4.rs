//! AWS Signature Version 4 over the proxy's signed-envelope type.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::error::ProxyError;

type HmacSha256 = Hmac<Sha256>;

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

#[derive(Debug, Clone)]
pub struct SigV4Timestamp {
    pub amz_date: String,
    pub date: String,
}

impl SigV4Timestamp {
    pub fn now() -> Result<Self, ProxyError> {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    pub fn from_datetime(datetime: OffsetDateTime) -> Result<Self, ProxyError> {
        const AMZ_FORMAT: &[FormatItem<'_>] =
            format_description!("[year][month][day]T[hour][minute][second]Z");
        const DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year][month][day]");
        let amz_date = datetime
            .format(AMZ_FORMAT)
            .map_err(|err| ProxyError::upstream_fatal(format!("sigv4 date format: {err}")))?;
        let date = datetime
            .format(DATE_FORMAT)
            .map_err(|err| ProxyError::upstream_fatal(format!("sigv4 date format: {err}")))?;
        Ok(Self { amz_date, date })
    }

    pub fn from_amz_date(amz_date: &str) -> Result<Self, ProxyError> {
        let amz_date = amz_date.trim();
        if amz_date.len() < 8 {
            return Err(ProxyError::upstream_fatal("sigv4 amz date too short"));
        }
        Ok(Self {
            amz_date: amz_date.to_string(),
            date: amz_date[..8].to_string(),
        })
    }
}

pub struct SigV4Signer {
    access_key: String,
    secret_key: String,
    region: String,
    service: String,
}

#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
    pub host: String,
}

impl SignedHeaders {
    pub fn into_pairs(self) -> Vec<(String, String)> {
        vec![
            ("authorization".to_string(), self.authorization),
            ("x-amz-date".to_string(), self.amz_date),
            ("x-amz-content-sha256".to_string(), self.content_sha256),
            ("host".to_string(), self.host),
        ]
    }
}

impl SigV4Signer {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: region.into(),
            service: service.into(),
        }
    }

    /// Signs a canonical request over `host`, `path` (already
    /// percent-decoded path, optional `?query`), headers and payload.
    pub fn sign(
        &self,
        method: &str,
        host: &str,
        path_and_query: &str,
        headers: &BTreeMap<String, String>,
        payload: &[u8],
        timestamp: SigV4Timestamp,
    ) -> Result<SignedHeaders, ProxyError> {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, query),
            None => (path_and_query, ""),
        };
        let payload_hash = sha256_hex(payload);

        let mut canonical_headers: BTreeMap<String, String> = headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), normalize_value(value)))
            .collect();
        canonical_headers.insert("host".to_string(), host.to_string());
        canonical_headers.insert("x-amz-date".to_string(), timestamp.amz_date.clone());
        canonical_headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());

        let signed_header_names = canonical_headers
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(";");
        let mut header_block = String::new();
        for (name, value) in &canonical_headers {
            header_block.push_str(name);
            header_block.push(':');
            header_block.push_str(value);
            header_block.push('\n');
        }

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            percent_encode(path, false),
            canonical_query(query),
            header_block,
            signed_header_names,
            payload_hash
        );

        let scope = format!(
            "{}/{}/{}/aws4_request",
            timestamp.date, self.region, self.service
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            timestamp.amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let k_date = hmac(format!("AWS4{}", self.secret_key).as_bytes(), &timestamp.date)?;
        let k_region = hmac(&k_date, &self.region)?;
        let k_service = hmac(&k_region, &self.service)?;
        let k_signing = hmac(&k_service, "aws4_request")?;
        let signature = hex_encode(&hmac(&k_signing, &string_to_sign)?);

        Ok(SignedHeaders {
            authorization: format!(
                "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
                self.access_key, scope, signed_header_names, signature
            ),
            amz_date: timestamp.amz_date,
            content_sha256: payload_hash,
            host: host.to_string(),
        })
    }
}

fn canonical_query(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (percent_encode(name, true), percent_encode(value, true)),
            None => (percent_encode(pair, true), String::new()),
        })
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn percent_encode(value: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for &byte in value.as_bytes() {
        let unreserved =
            matches!(byte, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~');
        if unreserved || (!encode_slash && byte == b'/') {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push(HEX_CHARS[(byte >> 4) as usize] as char);
            out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
        }
    }
    out
}

fn normalize_value(value: &str) -> String {
    let mut out = String::new();
    let mut last_space = false;
    for ch in value.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    out.trim().to_string()
}

fn hmac(key: &[u8], data: &str) -> Result<Vec<u8>, ProxyError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| ProxyError::upstream_fatal(format!("sigv4 hmac key: {err}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX_CHARS[(byte >> 4) as usize] as char);
        out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // The AWS SigV4 reference vector (GET iam ListUsers).
    #[test]
    fn matches_reference_signature() {
        let signer = SigV4Signer::new(
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "us-east-1",
            "iam",
        );
        let mut headers = BTreeMap::new();
        headers.insert(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded; charset=utf-8".to_string(),
        );
        let timestamp = SigV4Timestamp::from_amz_date("20150830T123600Z").unwrap();
        let signed = signer
            .sign(
                "GET",
                "iam.amazonaws.com",
                "/?Action=ListUsers&Version=2010-05-08",
                &headers,
                b"",
                timestamp,
            )
            .unwrap();
        assert_eq!(
            signed.authorization,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/iam/aws4_request, SignedHeaders=content-type;host;x-amz-content-sha256;x-amz-date, Signature=dd479fa8a80364edf2119ec24bebde66712ee9c9cb2b0d92eb3ab9ccdc0c3947"
        );
        assert_eq!(
            signed.content_sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    // The canonical URI percent-encodes the colon in Bedrock model IDs even
    // though the wire path carries it literally.
    #[test]
    fn bedrock_model_path_is_uri_encoded_in_canonical_form() {
        let signer = SigV4Signer::new("AKIDEXAMPLE", "secret", "us-east-1", "bedrock");
        let timestamp = SigV4Timestamp::from_amz_date("20240101T000000Z").unwrap();
        let signed = signer
            .sign(
                "POST",
                "bedrock-runtime.us-east-1.amazonaws.com",
                "/model/anthropic.claude-3-5-sonnet-20240620-v1:0/invoke",
                &BTreeMap::new(),
                b"{}",
                timestamp,
            )
            .unwrap();
        assert!(signed.authorization.contains("bedrock/aws4_request"));
    }
}
