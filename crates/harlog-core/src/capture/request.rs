use super::{capture_headers, header_str, json_text, json_value_text, multipart, CapturedBody};
use super::{OVERSIZED_BODY, UNPARSEABLE_JSON_BODY, UNSERIALIZABLE_BODY};
use crate::content_type::{classify, BodyKind};
use crate::har::{http_version, HarRequest, NameValue, PostData};
use crate::redaction::RedactionRule;
use http::request::Parts;
use http::HeaderMap;

/// Path prefix under which the instrumented router is mounted.
///
/// Insert it into request extensions when the router is nested, so the
/// captured URL reflects what the client actually requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPath(pub String);

/// Convert a request into a [`HarRequest`].
///
/// The `authorization` header is always masked before `rule` is applied.
/// `postData` is omitted entirely when there is no body.
pub fn capture_request(parts: &Parts, body: &CapturedBody, rule: &RedactionRule) -> HarRequest {
    let query_string = query_pairs(parts.uri.query(), rule);

    HarRequest {
        method: parts.method.to_string(),
        url: absolute_url(parts, &query_string, rule),
        http_version: http_version(parts.version).to_string(),
        headers: capture_headers(&parts.headers, rule, true),
        query_string,
        cookies: cookies(&parts.headers, rule),
        post_data: post_data(&parts.headers, body, rule),
    }
}

fn scheme(parts: &Parts) -> String {
    header_str(&parts.headers, "x-forwarded-proto")
        .and_then(|proto| {
            proto
                .split(',')
                .next()
                .map(|first| first.trim().to_ascii_lowercase())
        })
        .filter(|proto| !proto.is_empty())
        .or_else(|| parts.uri.scheme_str().map(str::to_string))
        .unwrap_or_else(|| "http".to_string())
}

fn host(parts: &Parts) -> String {
    header_str(&parts.headers, "x-forwarded-host")
        .or_else(|| header_str(&parts.headers, "host"))
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_else(|| "localhost".to_string())
}

/// The `(scheme, host)` pair the client used, honoring forwarding headers.
pub fn origin(parts: &Parts) -> (String, String) {
    (scheme(parts), host(parts))
}

fn absolute_url(parts: &Parts, query: &[NameValue], rule: &RedactionRule) -> String {
    let (scheme, host) = origin(parts);
    let mount = parts
        .extensions
        .get::<MountPath>()
        .map(|m| m.0.trim_end_matches('/'))
        .unwrap_or_default();

    let mut url = format!("{}://{}{}{}", scheme, host, mount, parts.uri.path());
    if let Some(raw) = parts.uri.query() {
        // Redacted parameters must not leak through the URL either.
        let rendered = if rule.pass_through() {
            raw.to_string()
        } else {
            let pairs: Vec<(&str, &str)> = query
                .iter()
                .map(|p| (p.name.as_str(), p.value.as_str()))
                .collect();
            serde_urlencoded::to_string(pairs).unwrap_or_default()
        };
        if !rendered.is_empty() {
            url.push('?');
            url.push_str(&rendered);
        }
    }
    url
}

fn query_pairs(query: Option<&str>, rule: &RedactionRule) -> Vec<NameValue> {
    let Some(query) = query else {
        return Vec::new();
    };
    let pairs = serde_urlencoded::from_str::<Vec<(String, String)>>(query).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "unparseable query string");
        Vec::new()
    });
    rule.filter_pairs(
        pairs
            .into_iter()
            .map(|(name, value)| NameValue::new(name, value))
            .collect(),
    )
}

fn cookies(headers: &HeaderMap, rule: &RedactionRule) -> Vec<NameValue> {
    let pairs = headers
        .get_all(http::header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|header| {
            cookie::Cookie::split_parse(header.to_string())
                .filter_map(Result::ok)
                .map(|c| NameValue::new(c.name(), c.value()))
                .collect::<Vec<_>>()
        })
        .collect();

    rule.filter_pairs(pairs)
}

fn post_data(headers: &HeaderMap, body: &CapturedBody, rule: &RedactionRule) -> Option<PostData> {
    let content_type = header_str(headers, "content-type");

    match body {
        CapturedBody::Empty => None,
        CapturedBody::Bytes(bytes) if bytes.is_empty() => None,
        CapturedBody::Unserializable => Some(PostData::text(
            content_type.unwrap_or_else(|| "application/json".to_string()),
            UNSERIALIZABLE_BODY,
        )),
        CapturedBody::TooLarge => Some(PostData::text(
            content_type.unwrap_or_else(|| "application/octet-stream".to_string()),
            OVERSIZED_BODY,
        )),
        CapturedBody::Json(value) => Some(PostData::text(
            content_type.unwrap_or_else(|| "application/json".to_string()),
            json_value_text(value, rule),
        )),
        CapturedBody::Bytes(bytes) => {
            let mime = content_type.unwrap_or_else(|| "application/octet-stream".to_string());
            let data = match classify(&mime) {
                BodyKind::Json => PostData::text(&mime, json_text(bytes, rule, "request")),
                BodyKind::Form => form(&mime, bytes, rule),
                BodyKind::Multipart => multipart_data(&mime, bytes, rule),
                BodyKind::Other => PostData::text(&mime, String::from_utf8_lossy(bytes)),
            };
            Some(data)
        }
    }
}

fn unparsed(mime: &str, raw: &[u8], rule: &RedactionRule) -> PostData {
    if rule.pass_through() {
        PostData::text(mime, String::from_utf8_lossy(raw))
    } else {
        PostData::text(mime, UNPARSEABLE_JSON_BODY)
    }
}

fn form(mime: &str, raw: &[u8], rule: &RedactionRule) -> PostData {
    match serde_urlencoded::from_bytes::<Vec<(String, String)>>(raw) {
        Ok(pairs) => {
            let params = rule
                .filter_pairs(
                    pairs
                        .into_iter()
                        .map(|(name, value)| NameValue::new(name, value))
                        .collect(),
                )
                .into_iter()
                .map(|p| crate::har::Param::field(p.name, p.value))
                .collect();
            PostData::params(mime, params)
        }
        Err(e) => {
            tracing::warn!(error = %e, "error parsing form body");
            unparsed(mime, raw, rule)
        }
    }
}

fn multipart_data(mime: &str, raw: &[u8], rule: &RedactionRule) -> PostData {
    let parts = multipart::extract_boundary(mime).and_then(|b| multipart::parse(raw, &b));
    match parts {
        Some(parts) => PostData::params(mime, multipart::to_params(parts, rule)),
        None => {
            tracing::debug!("multipart body without a usable boundary");
            unparsed(mime, raw, rule)
        }
    }
}
