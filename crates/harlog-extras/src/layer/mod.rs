//! Tower middleware that records every request/response pair it serves.
//!
//! Whether a request is logged is decided from its head. Requests that are
//! not logged stream straight through. For the rest, the request body is
//! read into memory up to `max_body_size` before the inner service runs,
//! then replayed unchanged. The response body streams through a
//! [`TeeBody`] that keeps a copy up to the same limit; once it has been
//! fully sent the transaction is assembled and queued for the collector.
//! Nothing here can fail the request: capture problems only cost the log
//! entry.
//!
//! # Example
//!
//! ```ignore
//! use harlog_extras::layer::MetricsLayer;
//! use harlog_core::{Group, MetricsOptions};
//!
//! let metrics = MetricsLayer::builder(MetricsOptions::new(api_key))
//!     .grouping(|parts| Some(Group::new().api_key(find_user(parts)?)))
//!     .build()?;
//!
//! let service = ServiceBuilder::new().layer(metrics.clone()).service(app);
//! // On shutdown:
//! metrics.logger().shutdown().await;
//! ```

mod body;
mod logger;

pub use body::{BoxError, RequestBody, TeeBody};
pub use logger::{GroupingFn, MetricsLogger, PeerAddr, PendingEntry, Transaction};

use crate::account::{AccountCache, AccountError, CacheStore};
use crate::dispatch::{CollectorSink, DispatchError, DispatchQueue, HttpCollector};
use bytes::Bytes;
use harlog_core::{ConfigError, Group, MetricsOptions};
use http::header::{HeaderName, HeaderValue};
use http::{request, Request, Response};
use http_body::Body;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tower_layer::Layer;
use tower_service::Service;

/// Response header linking to the log viewer entry.
pub const DOCUMENTATION_URL: HeaderName = HeaderName::from_static("x-documentation-url");

/// Why a [`MetricsLayer`] could not be built.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to create collector client: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("failed to create account client: {0}")]
    Account(#[from] AccountError),
}

/// Layer that wraps services in [`MetricsService`].
#[derive(Clone)]
pub struct MetricsLayer {
    logger: MetricsLogger,
}

impl MetricsLayer {
    pub fn builder(options: MetricsOptions) -> MetricsLayerBuilder {
        MetricsLayerBuilder {
            options,
            grouping: None,
            sink: None,
            cache_store: None,
        }
    }

    pub fn logger(&self) -> &MetricsLogger {
        &self.logger
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            logger: self.logger.clone(),
        }
    }
}

/// Builder for [`MetricsLayer`].
pub struct MetricsLayerBuilder {
    options: MetricsOptions,
    grouping: Option<GroupingFn>,
    sink: Option<Arc<dyn CollectorSink>>,
    cache_store: Option<Arc<dyn CacheStore>>,
}

impl MetricsLayerBuilder {
    /// Decide who each request belongs to. Required.
    pub fn grouping<F>(mut self, grouping: F) -> Self
    where
        F: Fn(&request::Parts) -> Option<Group> + Send + Sync + 'static,
    {
        self.grouping = Some(Arc::new(grouping));
        self
    }

    /// Send batches somewhere other than the HTTP collector.
    pub fn sink(mut self, sink: Arc<dyn CollectorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Keep account metadata in `store` instead of the default location.
    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    pub fn build(self) -> Result<MetricsLayer, BuildError> {
        let config = self.options.build()?;
        let grouping = self.grouping.ok_or(ConfigError::MissingGrouping)?;

        let sink = match self.sink {
            Some(sink) => sink,
            None => Arc::new(HttpCollector::new(
                &config.collector_url,
                config.api_key.clone(),
                config.timeout,
            )?),
        };
        let queue = Arc::new(DispatchQueue::new(config.buffer_length, sink));

        let account = if config.base_log_url.is_some() {
            None
        } else {
            let cache = AccountCache::from_config(&config)?;
            Some(match self.cache_store {
                Some(store) => cache.with_store(store),
                None => cache,
            })
        };

        tracing::debug!(
            buffer_length = config.buffer_length,
            development = config.development,
            "metrics layer configured"
        );

        Ok(MetricsLayer {
            logger: MetricsLogger::new(config, grouping, queue, account),
        })
    }
}

/// Service produced by [`MetricsLayer`].
#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    logger: MetricsLogger,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsService<S>
where
    S: Service<Request<RequestBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send,
    ReqBody: Body + Send + 'static,
    ReqBody::Error: Into<BoxError>,
    ResBody: Body<Data = Bytes> + Send + 'static,
{
    type Response = Response<TeeBody<ResBody>>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // The clone may not be ready; keep the one that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let logger = self.logger.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let Some(group) = logger.admit(&parts) else {
                let request = Request::from_parts(parts, RequestBody::streaming(body));
                return Ok(inner.call(request).await?.map(TeeBody::passthrough));
            };

            let limit = logger.config().max_body_size;
            let body = RequestBody::read(body, limit).await;
            let pending = logger.start(&parts, &body.captured(), group);
            let log_id = pending.log_id();

            let (response, doc_url) = tokio::join!(
                inner.call(Request::from_parts(parts, body)),
                logger.documentation_url(&log_id)
            );
            let mut response = response?;

            if let Some(value) = doc_url.and_then(|url| HeaderValue::from_str(&url).ok()) {
                response.headers_mut().insert(DOCUMENTATION_URL, value);
            }

            let (parts, body) = response.into_parts();
            let snapshot = snapshot(&parts);
            let body = TeeBody::new(body, limit, move |captured| {
                pending.finish(&snapshot, captured);
            });
            Ok(Response::from_parts(parts, body))
        })
    }
}

/// Copy of the parts the response capturer reads.
fn snapshot(parts: &http::response::Parts) -> http::response::Parts {
    let mut copy = Response::new(());
    *copy.status_mut() = parts.status;
    *copy.version_mut() = parts.version;
    *copy.headers_mut() = parts.headers.clone();
    copy.into_parts().0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchResult;
    use async_trait::async_trait;
    use http::{Method, StatusCode};
    use http_body_util::{BodyExt, Full};
    use serde_json::{json, Value};
    use std::convert::Infallible;
    use std::sync::Mutex;
    use tower::{service_fn, ServiceExt};

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<Value>>>,
    }

    impl RecordingSink {
        fn payloads(&self) -> Vec<Value> {
            self.batches.lock().unwrap().iter().flatten().cloned().collect()
        }
    }

    #[async_trait]
    impl CollectorSink for RecordingSink {
        async fn send(&self, batch: Vec<String>) -> DispatchResult<()> {
            let batch = batch
                .iter()
                .map(|p| serde_json::from_str(p).unwrap())
                .collect();
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    fn layer(options: MetricsOptions, sink: Arc<RecordingSink>) -> MetricsLayer {
        MetricsLayer::builder(options.buffer_length(1))
            .grouping(|_| Some(Group::new().api_key("owlbert-key").label("Owlbert")))
            .sink(sink)
            .build()
            .unwrap()
    }

    async fn echo(req: Request<RequestBody>) -> Result<Response<Full<Bytes>>, Infallible> {
        let body = req.into_body().collect().await.unwrap().to_bytes();
        Ok(Response::builder()
            .status(StatusCode::CREATED)
            .header("content-type", "application/json")
            .body(Full::new(body))
            .unwrap())
    }

    fn post(body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri("http://api.example.com/pets")
            .header("content-type", "application/json")
            .header("authorization", "Bearer 123456")
            .body(Full::new(Bytes::from(body)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_layer_records_transaction() {
        let sink = Arc::new(RecordingSink::default());
        let metrics = layer(
            MetricsOptions::new("key")
                .base_log_url("https://docs.example.com")
                .denylist(["password"]),
            sink.clone(),
        );
        let service = metrics.layer(service_fn(echo));

        let response = service
            .oneshot(post(r#"{"password":"123456","name":"Buster"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let doc_url = response
            .headers()
            .get(DOCUMENTATION_URL)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(doc_url.starts_with("https://docs.example.com/logs/"));

        // The application sees the original body.
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from(r#"{"password":"123456","name":"Buster"}"#));

        metrics.logger().queue().wait_idle().await;
        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 1);

        let payload = &payloads[0];
        let id = payload["_id"].as_str().unwrap();
        assert!(doc_url.ends_with(id));

        let entry = &payload["request"]["log"]["entries"][0];
        assert_eq!(
            entry["request"]["postData"]["text"],
            json!(r#"{"password":"[REDACTED 6]","name":"Buster"}"#)
        );
        assert_eq!(
            entry["response"]["content"]["text"],
            json!(r#"{"password":"[REDACTED 6]","name":"Buster"}"#)
        );
        assert_eq!(entry["response"]["status"], json!(201));

        let auth = entry["request"]["headers"]
            .as_array()
            .unwrap()
            .iter()
            .find(|h| h["name"] == "authorization")
            .unwrap();
        let masked = auth["value"].as_str().unwrap();
        assert!(masked.starts_with("sha512-"));
        assert!(masked.ends_with("?3456"));
    }

    /// Echoes the body back, reporting whether it arrived buffered.
    async fn inspect(req: Request<RequestBody>) -> Result<Response<Full<Bytes>>, Infallible> {
        let buffered = if req.body().is_complete() { "yes" } else { "no" };
        let body = req.into_body().collect().await.unwrap().to_bytes();
        Ok(Response::builder()
            .header("x-buffered", buffered)
            .body(Full::new(body))
            .unwrap())
    }

    #[tokio::test]
    async fn test_options_requests_pass_through() {
        let sink = Arc::new(RecordingSink::default());
        let metrics = layer(
            MetricsOptions::new("key").base_log_url("https://docs.example.com"),
            sink.clone(),
        );
        let service = metrics.layer(service_fn(inspect));

        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("http://api.example.com/pets")
            .body(Full::new(Bytes::from("preflight")))
            .unwrap();
        let response = service.oneshot(request).await.unwrap();
        assert!(response.headers().get(DOCUMENTATION_URL).is_none());
        assert_eq!(response.headers()["x-buffered"], "no");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("preflight"));

        metrics.logger().shutdown().await;
        assert!(sink.payloads().is_empty());
    }

    #[tokio::test]
    async fn test_declined_requests_are_not_buffered() {
        let sink = Arc::new(RecordingSink::default());
        let metrics = MetricsLayer::builder(
            MetricsOptions::new("key")
                .buffer_length(1)
                .base_log_url("https://docs.example.com"),
        )
        .grouping(|_| None)
        .sink(sink.clone())
        .build()
        .unwrap();
        let service = metrics.layer(service_fn(inspect));

        let response = service.oneshot(post(r#"{"a":1}"#)).await.unwrap();
        assert_eq!(response.headers()["x-buffered"], "no");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from(r#"{"a":1}"#));

        metrics.logger().shutdown().await;
        assert!(sink.payloads().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_bodies_are_served_but_not_captured() {
        let sink = Arc::new(RecordingSink::default());
        let metrics = layer(
            MetricsOptions::new("key")
                .base_log_url("https://docs.example.com")
                .max_body_size(16),
            sink.clone(),
        );
        let service = metrics.layer(service_fn(inspect));

        let large = r#"{"name":"Buster","bio":"a very good dog"}"#;
        let response = service.oneshot(post(large)).await.unwrap();
        assert_eq!(response.headers()["x-buffered"], "no");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from(large));

        metrics.logger().queue().wait_idle().await;
        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 1);

        let entry = &payloads[0]["request"]["log"]["entries"][0];
        assert_eq!(
            entry["request"]["postData"]["text"],
            json!(harlog_core::capture::OVERSIZED_BODY)
        );
        assert_eq!(
            entry["response"]["content"]["text"],
            json!(harlog_core::capture::OVERSIZED_BODY)
        );
    }

    #[tokio::test]
    async fn test_no_header_without_base_url() {
        let sink = Arc::new(RecordingSink::default());
        // Nothing listens on this port; the lookup fails open.
        let metrics = MetricsLayer::builder(
            MetricsOptions::new("key")
                .buffer_length(1)
                .account_api_url("http://127.0.0.1:9")
                .timeout(std::time::Duration::from_millis(200)),
        )
        .grouping(|_| Some(Group::new().id("owl")))
        .sink(sink.clone())
        .cache_store(Arc::new(crate::account::MemoryCacheStore::new()))
        .build()
        .unwrap();
        let service = metrics.layer(service_fn(echo));

        let response = service.oneshot(post("{}")).await.unwrap();
        assert!(response.headers().get(DOCUMENTATION_URL).is_none());
        response.into_body().collect().await.unwrap();

        metrics.logger().queue().wait_idle().await;
        assert_eq!(sink.payloads().len(), 1);
    }

    #[test]
    fn test_build_requires_grouping() {
        let result = MetricsLayer::builder(MetricsOptions::new("key")).build();
        assert!(matches!(
            result,
            Err(BuildError::Config(ConfigError::MissingGrouping))
        ));

        let result = MetricsLayer::builder(MetricsOptions::new(""))
            .grouping(|_| None)
            .build();
        assert!(matches!(
            result,
            Err(BuildError::Config(ConfigError::MissingApiKey))
        ));
    }
}
