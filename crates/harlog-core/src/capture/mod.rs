//! Conversion of HTTP requests and responses into redacted HAR objects.
//!
//! Capture never fails. Bodies that cannot be parsed or serialized are
//! recorded as raw text when no redaction is configured, and as a fixed
//! sentinel otherwise, so unparsed secrets are never shipped.

pub mod multipart;
mod request;
mod response;

pub use request::{capture_request, origin, MountPath};
pub use response::capture_response;

use crate::har::NameValue;
use crate::mask::mask;
use crate::redaction::RedactionRule;
use bytes::Bytes;
use http::HeaderMap;
use serde::Serialize;
use serde_json::Value;

/// Recorded in place of a body that could not be serialized to JSON.
pub const UNSERIALIZABLE_BODY: &str =
    "[harlog is unable to serialize this body as JSON. The payload was not captured.]";

/// Recorded in place of a JSON body that failed to parse while a
/// redaction rule was active.
pub const UNPARSEABLE_JSON_BODY: &str =
    "[harlog could not parse this JSON body for redaction. The payload was not captured.]";

/// Recorded in place of a body larger than the configured capture limit.
pub const OVERSIZED_BODY: &str =
    "[harlog did not capture this body because it exceeds the maximum body size.]";

/// A body as observed by the capturer.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum CapturedBody {
    /// No body was sent.
    #[default]
    Empty,
    /// Raw bytes read from the wire.
    Bytes(Bytes),
    /// An already-structured body handed over by the host application.
    Json(Value),
    /// A structured body that failed to serialize.
    Unserializable,
    /// A body that was not kept because it exceeded the capture limit.
    TooLarge,
}

impl CapturedBody {
    /// Capture a structured value, degrading to [`CapturedBody::Unserializable`]
    /// when it cannot be represented as JSON.
    pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => Self::Json(value),
            Err(e) => {
                tracing::warn!(error = %e, "body is not serializable as JSON");
                Self::Unserializable
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Bytes(bytes) => bytes.is_empty(),
            _ => false,
        }
    }
}

impl From<Bytes> for CapturedBody {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            Self::Empty
        } else {
            Self::Bytes(bytes)
        }
    }
}

impl From<Vec<u8>> for CapturedBody {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<&'static str> for CapturedBody {
    fn from(text: &'static str) -> Self {
        Bytes::from_static(text.as_bytes()).into()
    }
}

impl From<Value> for CapturedBody {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

pub(crate) fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
}

/// Collect headers in order and apply `rule`. A masked `authorization`
/// value is already a digest and is kept whatever the rule says.
pub(crate) fn capture_headers(
    headers: &HeaderMap,
    rule: &RedactionRule,
    mask_authorization: bool,
) -> Vec<NameValue> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = String::from_utf8_lossy(value.as_bytes());
            if mask_authorization && *name == http::header::AUTHORIZATION {
                NameValue::new(name.as_str(), mask(&value))
            } else {
                rule.filter_pair(NameValue::new(name.as_str(), value))
            }
        })
        .collect()
}

/// Parse and redact a JSON body, falling back per the module policy.
pub(crate) fn json_text(raw: &[u8], rule: &RedactionRule, what: &'static str) -> String {
    if rule.pass_through() {
        return String::from_utf8_lossy(raw).into_owned();
    }

    match serde_json::from_slice::<Value>(raw) {
        Ok(value) => json_value_text(&value, rule),
        Err(e) => {
            tracing::warn!(error = %e, body = what, "error parsing JSON body");
            UNPARSEABLE_JSON_BODY.to_string()
        }
    }
}

pub(crate) fn json_value_text(value: &Value, rule: &RedactionRule) -> String {
    let filtered = rule.filter_json(value);
    serde_json::to_string(&filtered).unwrap_or_else(|_| UNSERIALIZABLE_BODY.to_string())
}
