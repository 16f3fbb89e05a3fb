//! Final submission payloads.

use crate::group::PayloadGroup;
use crate::har::{CacheInfo, Creator, HarEntry, HarLog, HarRequest, HarResponse, Timings};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// One request/response cycle, ready to be queued for the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "_id")]
    pub log_id: Uuid,
    pub group: PayloadGroup,
    #[serde(rename = "clientIPAddress")]
    pub client_ip_address: String,
    pub development: bool,
    pub request: RequestLog,
}

/// Wrapper matching the collector's `{"log": {...}}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLog {
    pub log: HarLog,
}

impl Payload {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// The single entry this payload carries.
    pub fn entry(&self) -> Option<&HarEntry> {
        self.request.log.entries.first()
    }
}

/// Everything about a transaction that isn't part of the HAR request or
/// response themselves.
#[derive(Debug, Clone)]
pub struct EntryContext {
    /// Log id supplied by the caller; kept only if it is a valid v4 UUID.
    pub log_id: Option<String>,
    pub started: DateTime<Utc>,
    pub elapsed: Duration,
    pub client_ip: String,
    pub development: bool,
    pub creator: Creator,
}

impl EntryContext {
    pub fn new(started: DateTime<Utc>, elapsed: Duration) -> Self {
        Self {
            log_id: None,
            started,
            elapsed,
            client_ip: String::new(),
            development: false,
            creator: Creator::default(),
        }
    }
}

/// Use the supplied id when it is a v4 UUID, otherwise mint a fresh one.
pub fn log_id(supplied: Option<&str>) -> Uuid {
    supplied
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .filter(|id| id.get_version_num() == 4)
        .unwrap_or_else(Uuid::new_v4)
}

/// Link to a captured transaction in the log viewer.
pub fn documentation_url(base_log_url: &str, log_id: &Uuid) -> String {
    format!("{}/logs/{}", base_log_url.trim_end_matches('/'), log_id)
}

/// Wrap a captured request and response into a [`Payload`].
pub fn assemble(
    request: HarRequest,
    response: HarResponse,
    group: PayloadGroup,
    ctx: &EntryContext,
) -> Payload {
    let time = u64::try_from(ctx.elapsed.as_millis()).unwrap_or(u64::MAX);
    let pageref = request
        .url
        .split('?')
        .next()
        .map(str::to_string);

    let log_id = log_id(ctx.log_id.as_deref());
    let entry = HarEntry {
        id: log_id,
        pageref,
        started_date_time: ctx.started,
        time,
        request,
        response,
        cache: CacheInfo::default(),
        timings: Timings::waited(time),
    };

    Payload {
        log_id,
        group,
        client_ip_address: ctx.client_ip.clone(),
        development: ctx.development,
        request: RequestLog {
            log: HarLog::single(ctx.creator.clone(), entry),
        },
    }
}
