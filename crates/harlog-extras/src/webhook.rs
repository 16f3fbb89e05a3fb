//! Webhook signature verification.
//!
//! Signed webhook requests carry a `readme-signature` header of the form
//! `t=<epoch-ms>,v0=<hex hmac-sha256>`, where the HMAC is computed over
//! `"<t>.<raw body>"` with a shared secret.
//!
//! # Example
//!
//! ```ignore
//! use harlog_extras::webhook::{verify, SIGNATURE_HEADER};
//!
//! let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
//! let body = verify(&raw_body, signature, &secret)?;
//! ```

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "readme-signature";

/// Signatures older than this are rejected.
pub const SIGNATURE_TOLERANCE: Duration = Duration::from_secs(30 * 60);

const SCHEME: &str = "v0";

/// Why a webhook was rejected.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Missing Signature")]
    MissingSignature,

    #[error("Expired Signature")]
    ExpiredSignature,

    #[error("Invalid Signature")]
    InvalidSignature,

    /// The verified body is not the expected JSON.
    #[error("invalid webhook body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Result type alias for webhook verification.
pub type WebhookResult<T> = std::result::Result<T, WebhookError>;

/// Check `signature` against `body` and return the body unchanged.
///
/// Checks run in order: a missing or empty header is
/// [`WebhookError::MissingSignature`], a timestamp older than
/// [`SIGNATURE_TOLERANCE`] (or no timestamp at all) is
/// [`WebhookError::ExpiredSignature`], and anything else that doesn't
/// match is [`WebhookError::InvalidSignature`].
pub fn verify<'a>(body: &'a str, signature: Option<&str>, secret: &str) -> WebhookResult<&'a str> {
    verify_at(body, signature, secret, Utc::now().timestamp_millis())
}

/// Verify, then deserialize the body.
pub fn verify_json<T: DeserializeOwned>(
    body: &str,
    signature: Option<&str>,
    secret: &str,
) -> WebhookResult<T> {
    let body = verify(body, signature, secret)?;
    Ok(serde_json::from_str(body)?)
}

/// Build a signature header value for `body` signed at `timestamp_ms`.
pub fn sign(body: &str, secret: &str, timestamp_ms: i64) -> String {
    let digest = hex::encode(mac(secret, &timestamp_ms.to_string(), body).finalize().into_bytes());
    format!("t={},{}={}", timestamp_ms, SCHEME, digest)
}

fn mac(secret: &str, time: &str, body: &str) -> HmacSha256 {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac key length is unrestricted"),
    };
    mac.update(time.as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    mac
}

fn verify_at<'a>(
    body: &'a str,
    signature: Option<&str>,
    secret: &str,
    now_ms: i64,
) -> WebhookResult<&'a str> {
    let signature = signature
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(WebhookError::MissingSignature)?;

    let mut time = None;
    let mut digest = None;
    for item in signature.split(',') {
        match item.trim().split_once('=') {
            Some(("t", value)) => time = Some(value),
            Some((SCHEME, value)) => digest = Some(value),
            _ => {}
        }
    }

    let time = time.ok_or(WebhookError::ExpiredSignature)?;
    let timestamp: i64 = time.parse().map_err(|_| WebhookError::InvalidSignature)?;
    let tolerance = i64::try_from(SIGNATURE_TOLERANCE.as_millis()).unwrap_or(i64::MAX);
    if now_ms.saturating_sub(timestamp) > tolerance {
        return Err(WebhookError::ExpiredSignature);
    }

    let expected = digest
        .and_then(|d| hex::decode(d).ok())
        .ok_or(WebhookError::InvalidSignature)?;
    mac(secret, time, body)
        .verify_slice(&expected)
        .map_err(|_| WebhookError::InvalidSignature)?;

    Ok(body)
}
