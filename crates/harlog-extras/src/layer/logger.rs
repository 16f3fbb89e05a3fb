//! The logging core shared by the tower layer and manual logging.

use crate::account::AccountCache;
use crate::dispatch::DispatchQueue;
use chrono::{DateTime, Utc};
use harlog_core::capture::origin;
use harlog_core::{
    assemble, capture_request, capture_response, documentation_url, CapturedBody, Creator,
    EntryContext, Group, HarRequest, MetricsConfig, PayloadGroup,
};
use http::{request, response, Method};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Maps a request to the identity it belongs to. `None` skips logging.
pub type GroupingFn = Arc<dyn Fn(&request::Parts) -> Option<Group> + Send + Sync>;

/// The immediate peer of a connection, inserted into request extensions by
/// the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Captures transactions and queues them for the collector.
#[derive(Clone)]
pub struct MetricsLogger {
    inner: Arc<LoggerState>,
}

struct LoggerState {
    config: MetricsConfig,
    grouping: GroupingFn,
    queue: Arc<DispatchQueue>,
    account: Option<AccountCache>,
    creator: Creator,
}

/// A finished transaction handed over by the host application.
pub struct Transaction<'a> {
    pub request: &'a request::Parts,
    pub request_body: CapturedBody,
    pub response: &'a response::Parts,
    pub response_body: CapturedBody,
    pub started: DateTime<Utc>,
    pub elapsed: Duration,
    /// Reused as the log id when it is a v4 UUID.
    pub log_id: Option<String>,
}

impl MetricsLogger {
    /// `account` is only consulted when no base log URL is configured.
    pub fn new(
        config: MetricsConfig,
        grouping: GroupingFn,
        queue: Arc<DispatchQueue>,
        account: Option<AccountCache>,
    ) -> Self {
        Self {
            inner: Arc::new(LoggerState {
                config,
                grouping,
                queue,
                account,
                creator: Creator::default(),
            }),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.inner.queue
    }

    /// Flush everything still buffered. Call before the process exits.
    pub async fn shutdown(&self) {
        self.inner.queue.shutdown().await;
    }

    /// Capture the request side of a transaction.
    ///
    /// Returns `None` when the request should not be logged; see
    /// [`admit`](Self::admit).
    pub fn prepare(&self, parts: &request::Parts, body: &CapturedBody) -> Option<PendingEntry> {
        let group = self.admit(parts)?;
        Some(self.start(parts, body, group))
    }

    /// Capture the request side of a transaction already admitted.
    pub fn start(
        &self,
        parts: &request::Parts,
        body: &CapturedBody,
        group: PayloadGroup,
    ) -> PendingEntry {
        PendingEntry {
            logger: self.clone(),
            log_id: Uuid::new_v4(),
            request: capture_request(parts, body, &self.inner.config.redaction),
            group,
            client_ip: client_ip(parts),
            started: Utc::now(),
            clock: Instant::now(),
        }
    }

    /// Log a transaction the host captured itself.
    ///
    /// Returns the log id, or `None` if the transaction was skipped.
    pub fn log(&self, tx: Transaction<'_>) -> Option<Uuid> {
        let group = self.admit(tx.request)?;
        let request = capture_request(tx.request, &tx.request_body, &self.inner.config.redaction);
        let ctx = EntryContext {
            log_id: tx.log_id,
            started: tx.started,
            elapsed: tx.elapsed,
            client_ip: client_ip(tx.request),
            development: self.inner.config.development,
            creator: self.inner.creator.clone(),
        };
        self.submit(request, tx.response, &tx.response_body, group, &ctx)
    }

    /// Link to the log viewer entry for `log_id`, if a base URL is known.
    ///
    /// May consult the account API, bounded by the configured timeout.
    pub async fn documentation_url(&self, log_id: &Uuid) -> Option<String> {
        let base = match &self.inner.config.base_log_url {
            Some(url) => url.clone(),
            None => {
                let account = self.inner.account.as_ref()?;
                account.get_base_url(&self.inner.config.api_key).await?
            }
        };
        Some(documentation_url(&base, log_id))
    }

    /// Decide whether a request is logged, from its head alone.
    ///
    /// `OPTIONS` requests, hosts outside `allowed_hosts`, and requests the
    /// grouping function declines or that resolve to no group id are not.
    pub fn admit(&self, parts: &request::Parts) -> Option<PayloadGroup> {
        if parts.method == Method::OPTIONS {
            tracing::debug!("skipping OPTIONS request");
            return None;
        }

        let (_, host) = origin(parts);
        if !self.inner.config.host_allowed(&host) {
            tracing::debug!(host = %host, "skipping request to host not in allowed_hosts");
            return None;
        }

        let Some(group) = (self.inner.grouping)(parts) else {
            tracing::debug!(path = %parts.uri.path(), "grouping declined request");
            return None;
        };
        let resolved = group.resolve(parts);
        if resolved.is_none() {
            tracing::debug!(path = %parts.uri.path(), "no group id could be resolved");
        }
        resolved
    }

    fn submit(
        &self,
        request: HarRequest,
        response: &response::Parts,
        body: &CapturedBody,
        group: PayloadGroup,
        ctx: &EntryContext,
    ) -> Option<Uuid> {
        let response = capture_response(response, body, &self.inner.config.redaction);
        let payload = assemble(request, response, group, ctx);

        match payload.to_json() {
            Ok(json) => {
                self.inner.queue.enqueue(json);
                Some(payload.log_id)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize payload");
                None
            }
        }
    }
}

fn client_ip(parts: &request::Parts) -> String {
    parts
        .extensions
        .get::<PeerAddr>()
        .map(|p| p.0)
        .or_else(|| parts.extensions.get::<SocketAddr>().copied())
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default()
}

/// A captured request waiting for its response.
pub struct PendingEntry {
    logger: MetricsLogger,
    log_id: Uuid,
    request: HarRequest,
    group: PayloadGroup,
    client_ip: String,
    started: DateTime<Utc>,
    clock: Instant,
}

impl PendingEntry {
    pub fn log_id(&self) -> Uuid {
        self.log_id
    }

    /// Capture the response and queue the payload.
    pub fn finish(self, response: &response::Parts, body: CapturedBody) -> Option<Uuid> {
        let config = &self.logger.inner.config;
        let ctx = EntryContext {
            log_id: Some(self.log_id.to_string()),
            started: self.started,
            elapsed: self.clock.elapsed(),
            client_ip: self.client_ip,
            development: config.development,
            creator: self.logger.inner.creator.clone(),
        };
        self.logger
            .submit(self.request, response, &body, self.group, &ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{CollectorSink, DispatchResult};
    use async_trait::async_trait;
    use harlog_core::MetricsOptions;
    use http::{Request, Response, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        payloads: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl CollectorSink for RecordingSink {
        async fn send(&self, batch: Vec<String>) -> DispatchResult<()> {
            let mut payloads = self.payloads.lock().unwrap();
            for item in batch {
                payloads.push(serde_json::from_str(&item).unwrap());
            }
            Ok(())
        }
    }

    fn logger(options: MetricsOptions, sink: Arc<RecordingSink>) -> MetricsLogger {
        let config = options.buffer_length(1).build().unwrap();
        let queue = Arc::new(DispatchQueue::new(config.buffer_length, sink));
        let grouping: GroupingFn = Arc::new(|parts: &request::Parts| {
            if parts.uri.path() == "/anonymous" {
                None
            } else {
                Some(Group::new().api_key("owlbert-key").label("Owlbert"))
            }
        });
        MetricsLogger::new(config, grouping, queue, None)
    }

    fn request(method: Method, uri: &str) -> request::Parts {
        let mut parts = Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "api.example.com")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        parts
            .extensions
            .insert(PeerAddr("[::ffff:127.0.0.1]:4000".parse().unwrap()));
        parts
    }

    fn response() -> response::Parts {
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[tokio::test]
    async fn test_pending_entry_round_trip() {
        let sink = Arc::new(RecordingSink::default());
        let logger = logger(MetricsOptions::new("key"), sink.clone());

        let pending = logger
            .prepare(&request(Method::GET, "/pets?limit=1"), &CapturedBody::Empty)
            .unwrap();
        let id = pending.log_id();
        let logged = pending.finish(&response(), CapturedBody::from(b"[]".to_vec()));
        assert_eq!(logged, Some(id));

        logger.queue().wait_idle().await;
        let payloads = sink.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["_id"], json!(id.to_string()));
        assert_eq!(payloads[0]["clientIPAddress"], json!("::ffff:127.0.0.1"));
        assert_eq!(payloads[0]["group"], json!({"id": "owlbert-key", "label": "Owlbert"}));

        let entry = &payloads[0]["request"]["log"]["entries"][0];
        assert_eq!(
            entry["request"]["url"],
            json!("http://api.example.com/pets?limit=1")
        );
        assert_eq!(entry["response"]["content"]["text"], json!("[]"));
    }

    #[test]
    fn test_skip_rules() {
        let sink = Arc::new(RecordingSink::default());
        let logger = logger(
            MetricsOptions::new("key").allowed_hosts(["api.example.com"]),
            sink,
        );

        assert!(logger
            .prepare(&request(Method::OPTIONS, "/pets"), &CapturedBody::Empty)
            .is_none());
        assert!(logger
            .prepare(&request(Method::GET, "/anonymous"), &CapturedBody::Empty)
            .is_none());
        assert!(logger
            .prepare(&request(Method::GET, "/pets"), &CapturedBody::Empty)
            .is_some());

        let mut other_host = request(Method::GET, "/pets");
        other_host
            .headers
            .insert("host", "internal.example.com".parse().unwrap());
        assert!(logger.prepare(&other_host, &CapturedBody::Empty).is_none());
    }

    #[tokio::test]
    async fn test_manual_log_keeps_supplied_id() {
        let sink = Arc::new(RecordingSink::default());
        let logger = logger(MetricsOptions::new("key").development(true), sink.clone());
        let supplied = "0c3a4c53-1c2e-4d4b-9f6e-8b0c1d2e3f4a";

        let id = logger.log(Transaction {
            request: &request(Method::POST, "/pets"),
            request_body: CapturedBody::Json(json!({"name": "Buster"})),
            response: &response(),
            response_body: CapturedBody::Json(json!({"id": 1})),
            started: Utc::now(),
            elapsed: Duration::from_millis(12),
            log_id: Some(supplied.to_string()),
        });
        assert_eq!(id.map(|id| id.to_string()).as_deref(), Some(supplied));

        logger.queue().wait_idle().await;
        let payloads = sink.payloads.lock().unwrap();
        assert_eq!(payloads[0]["development"], json!(true));
        assert_eq!(payloads[0]["request"]["log"]["entries"][0]["time"], json!(12));
    }

    #[tokio::test]
    async fn test_documentation_url_from_base_log_url() {
        let sink = Arc::new(RecordingSink::default());
        let logger = logger(
            MetricsOptions::new("key").base_log_url("https://docs.example.com"),
            sink,
        );
        let id = Uuid::new_v4();

        assert_eq!(
            logger.documentation_url(&id).await,
            Some(format!("https://docs.example.com/logs/{}", id))
        );
    }

    #[tokio::test]
    async fn test_no_documentation_url_without_source() {
        let sink = Arc::new(RecordingSink::default());
        let logger = logger(MetricsOptions::new("key"), sink);

        assert_eq!(logger.documentation_url(&Uuid::new_v4()).await, None);
    }
}
