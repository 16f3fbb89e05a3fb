//! Batching dispatch of payloads to the collector.
//!
//! Payloads are appended to an in-memory buffer. Once the buffer holds
//! `buffer_length` entries, exactly that many of the oldest entries are
//! removed as one batch and handed to a spawned task that POSTs them. The
//! enqueueing caller never waits for the network. Delivery is
//! at-most-once: failed batches are logged and dropped.
//!
//! # Example
//!
//! ```ignore
//! use harlog_extras::dispatch::{DispatchQueue, HttpCollector};
//! use std::sync::Arc;
//!
//! let sink = HttpCollector::new("https://metrics.example.com", "api-key", timeout)?;
//! let queue = DispatchQueue::new(10, Arc::new(sink));
//! queue.enqueue(payload_json);
//! // On shutdown:
//! queue.shutdown().await;
//! ```

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Error type for batch delivery.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The HTTP request could not be made.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The collector answered with a non-success status.
    #[error("collector returned {status}: {body}")]
    Status { status: u16, body: String },

    /// No Tokio runtime was available to run the send.
    #[error("no async runtime available")]
    NoRuntime,
}

/// Result type alias for dispatch operations.
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

/// Destination for batches of serialized payloads.
#[async_trait]
pub trait CollectorSink: Send + Sync + 'static {
    /// Deliver one batch. Items are serialized payload objects, in order.
    async fn send(&self, batch: Vec<String>) -> DispatchResult<()>;
}

/// Join serialized payloads into a JSON array without re-parsing them.
pub fn batch_body(batch: &[String]) -> String {
    let mut body = String::with_capacity(batch.iter().map(|p| p.len() + 1).sum::<usize>() + 2);
    body.push('[');
    for (i, payload) in batch.iter().enumerate() {
        if i > 0 {
            body.push(',');
        }
        body.push_str(payload);
    }
    body.push(']');
    body
}

/// Sends batches to `<collector>/v1/request` with Basic auth.
#[derive(Clone)]
pub struct HttpCollector {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpCollector {
    /// Create a collector client.
    ///
    /// `api_key` is sent as the Basic auth username with an empty password.
    pub fn new(
        collector_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> DispatchResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("harlog/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/v1/request", collector_url.trim_end_matches('/')),
            api_key: api_key.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CollectorSink for HttpCollector {
    async fn send(&self, batch: Vec<String>) -> DispatchResult<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.api_key, Some(""))
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(batch_body(&batch))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(DispatchError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Buffer of serialized payloads, flushed in fixed-size batches.
pub struct DispatchQueue {
    buffer: Mutex<Vec<String>>,
    buffer_length: usize,
    sink: Arc<dyn CollectorSink>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchQueue {
    /// Create a queue flushing every `buffer_length` payloads (minimum 1).
    pub fn new(buffer_length: usize, sink: Arc<dyn CollectorSink>) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            buffer_length: buffer_length.max(1),
            sink,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn buffer_length(&self) -> usize {
        self.buffer_length
    }

    /// Number of payloads waiting for the next batch.
    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a payload; hands off a batch if the threshold is reached.
    pub fn enqueue(&self, payload: String) {
        let batch = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.push(payload);
            if buffer.len() >= self.buffer_length {
                Some(buffer.drain(..self.buffer_length).collect::<Vec<_>>())
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            if let Err(e) = self.spawn_send(batch) {
                tracing::warn!(error = %e, "dropping metrics batch");
            }
        }
    }

    fn spawn_send(&self, batch: Vec<String>) -> DispatchResult<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        let sink = Arc::clone(&self.sink);

        let task = handle.spawn(async move {
            let size = batch.len();
            match sink.send(batch).await {
                Ok(()) => tracing::debug!(batch = size, "metrics batch sent"),
                Err(e) => tracing::warn!(error = %e, batch = size, "failed to send metrics batch"),
            }
        });

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.retain(|t| !t.is_finished());
        in_flight.push(task);
        Ok(())
    }

    /// Wait for every batch already handed off to finish sending.
    pub async fn wait_idle(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            in_flight.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "metrics send task failed");
            }
        }
    }

    /// Send everything still buffered, in `buffer_length` chunks, and wait
    /// for all outstanding sends.
    pub async fn shutdown(&self) {
        let remaining: Vec<String> = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.drain(..).collect()
        };

        for chunk in remaining.chunks(self.buffer_length) {
            if let Err(e) = self.spawn_send(chunk.to_vec()) {
                tracing::warn!(error = %e, "dropping metrics batch");
            }
        }
        self.wait_idle().await;
    }
}
