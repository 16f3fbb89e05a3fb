use super::{capture_headers, header_str, json_text, json_value_text, CapturedBody};
use super::{OVERSIZED_BODY, UNSERIALIZABLE_BODY};
use crate::content_type::is_json;
use crate::har::{http_version, Content, HarResponse};
use crate::redaction::RedactionRule;
use http::response::Parts;

/// Convert a response and the body that was actually sent into a
/// [`HarResponse`].
///
/// JSON bodies are redacted and re-serialized; anything else is recorded
/// as the raw text that went over the wire. `content.size` is the byte
/// length of the stored text.
pub fn capture_response(parts: &Parts, body: &CapturedBody, rule: &RedactionRule) -> HarResponse {
    let mime_type =
        header_str(&parts.headers, "content-type").unwrap_or_else(|| "text/plain".to_string());

    let text = match body {
        CapturedBody::Empty => String::new(),
        CapturedBody::Unserializable => UNSERIALIZABLE_BODY.to_string(),
        CapturedBody::TooLarge => OVERSIZED_BODY.to_string(),
        CapturedBody::Json(value) => json_value_text(value, rule),
        CapturedBody::Bytes(bytes) if is_json(&mime_type) => json_text(bytes, rule, "response"),
        CapturedBody::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    };

    HarResponse {
        status: parts.status.as_u16(),
        status_text: parts
            .status
            .canonical_reason()
            .unwrap_or_default()
            .to_string(),
        http_version: http_version(parts.version).to_string(),
        headers: capture_headers(&parts.headers, rule, false),
        content: Content::new(text, mime_type),
    }
}
