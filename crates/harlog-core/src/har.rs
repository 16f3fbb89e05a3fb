//! HAR (HTTP Archive 1.2) data model.
//!
//! Only the subset of the format that harlog produces is modelled. Every
//! type round-trips through serde so batches can be inspected in tests
//! and re-read by tooling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// HAR format version written into every log.
pub const HAR_VERSION: &str = "1.2";

/// A `{name, value}` pair, used for headers, query parameters and cookies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

impl NameValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Metadata about the SDK that produced a log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creator {
    pub name: String,
    pub version: String,
    pub comment: String,
}

impl Default for Creator {
    /// The creator block for this build: crate name, crate version and
    /// `<arch>-<os>/rust` as the platform comment.
    fn default() -> Self {
        Self {
            name: "harlog".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            comment: format!(
                "{}-{}/rust",
                std::env::consts::ARCH,
                std::env::consts::OS
            ),
        }
    }
}

/// The `log` object wrapping one or more entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarLog {
    pub version: String,
    pub creator: Creator,
    pub entries: Vec<HarEntry>,
}

impl HarLog {
    /// A single-entry log.
    pub fn single(creator: Creator, entry: HarEntry) -> Self {
        Self {
            version: HAR_VERSION.to_string(),
            creator,
            entries: vec![entry],
        }
    }
}

/// One captured request/response cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    /// Same value as the payload's log id.
    pub id: Uuid,
    /// Absolute URL of the request without its query string.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pageref: Option<String>,
    pub started_date_time: DateTime<Utc>,
    /// Total elapsed time in milliseconds.
    pub time: u64,
    pub request: HarRequest,
    pub response: HarResponse,
    #[serde(default)]
    pub cache: CacheInfo,
    pub timings: Timings,
}

/// Always serialized as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    pub send: u64,
    pub wait: u64,
    pub receive: u64,
}

impl Timings {
    /// All of the elapsed time is attributed to waiting on the handler.
    pub fn waited(elapsed_ms: u64) -> Self {
        Self {
            send: 0,
            wait: elapsed_ms,
            receive: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub headers: Vec<NameValue>,
    pub query_string: Vec<NameValue>,
    pub cookies: Vec<NameValue>,
    /// Absent when the request carried no body.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub post_data: Option<PostData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostData {
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub params: Option<Vec<Param>>,
}

impl PostData {
    pub fn text(mime_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            text: Some(text.into()),
            params: None,
        }
    }

    pub fn params(mime_type: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            mime_type: mime_type.into(),
            text: None,
            params: Some(params),
        }
    }
}

/// A posted parameter: a form field or a multipart part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Param {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content_type: Option<String>,
}

impl Param {
    pub fn field(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            file_name: None,
            content_type: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    pub status: u16,
    pub status_text: String,
    pub http_version: String,
    pub headers: Vec<NameValue>,
    pub content: Content,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub text: String,
    /// Byte length of `text`.
    pub size: usize,
    pub mime_type: String,
}

impl Content {
    pub fn new(text: String, mime_type: impl Into<String>) -> Self {
        Self {
            size: text.len(),
            text,
            mime_type: mime_type.into(),
        }
    }
}

/// Renders an [`http::Version`] the way HAR expects it.
pub fn http_version(version: http::Version) -> &'static str {
    match version {
        http::Version::HTTP_09 => "HTTP/0.9",
        http::Version::HTTP_10 => "HTTP/1.0",
        http::Version::HTTP_2 => "HTTP/2.0",
        http::Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}
