use super::expectation::{Expectation, MockResponse, Times};
use super::matcher::RequestMatcher;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

type GenericError = Box<dyn std::error::Error + Send + Sync>;
type Result<T> = std::result::Result<T, GenericError>;

/// A mock HTTP server
///
/// Every request is recorded, matched or not. Unmatched requests get a 404.
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct ServerState {
    expectations: Vec<Expectation>,
    received: Vec<RecordedRequest>,
    unmatched: Vec<RecordedRequest>,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: http::Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

impl RecordedRequest {
    /// The body parsed as JSON, if it is JSON.
    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// The Basic auth username, if any.
    pub fn basic_user(&self) -> Option<String> {
        let header = self.headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
        let encoded = header.strip_prefix("Basic ")?;
        let decoded = String::from_utf8(STANDARD.decode(encoded).ok()?).ok()?;
        decoded.split(':').next().map(str::to_string)
    }
}

impl MockServer {
    /// Start a new mock server on a random port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("mock server failed to bind");
        let addr = listener
            .local_addr()
            .expect("mock server has no local address");

        let state = Arc::new(Mutex::new(ServerState::default()));

        let state_clone = state.clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut stop_future = shutdown_rx;

            loop {
                tokio::select! {
                    res = listener.accept() => {
                        match res {
                            Ok((stream, _)) => {
                                let io = TokioIo::new(stream);
                                let state = state_clone.clone();

                                tokio::spawn(async move {
                                    if let Err(err) = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                                        .serve_connection(io, service_fn(move |req| handle_request(req, state.clone())))
                                        .await
                                    {
                                        tracing::debug!(error = ?err, "mock server connection closed");
                                    }
                                });
                            }
                            Err(e) => tracing::warn!(error = %e, "mock server accept error"),
                        }
                    }
                    _ = &mut stop_future => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Get the base URL of the server
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Every request received so far, in arrival order
    pub fn received_requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().received.clone()
    }

    /// Get requests that didn't match any expectation
    pub fn unmatched_requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().unmatched.clone()
    }

    /// Wait until at least `n` requests arrived or `timeout` elapsed, then
    /// return what was received.
    pub async fn wait_for_requests(&self, n: usize, timeout: Duration) -> Vec<RecordedRequest> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let received = self.received_requests();
            if received.len() >= n || tokio::time::Instant::now() >= deadline {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Add an expectation
    pub fn expect(&self, matcher: RequestMatcher) -> ExpectationBuilder {
        ExpectationBuilder {
            server: self.state.clone(),
            expectation: Some(Expectation::new(matcher)),
        }
    }

    /// Verify that all expectations were met
    pub fn verify(&self) {
        let state = self.state.lock().unwrap();
        for exp in &state.expectations {
            if let Err(msg) = exp.check() {
                panic!("{}", msg);
            }
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub struct ExpectationBuilder {
    server: Arc<Mutex<ServerState>>,
    expectation: Option<Expectation>,
}

impl ExpectationBuilder {
    pub fn respond_with(mut self, response: MockResponse) -> Self {
        if let Some(exp) = self.expectation.take() {
            self.expectation = Some(exp.respond_with(response));
        }
        self
    }

    pub fn times(mut self, n: usize) -> Self {
        if let Some(exp) = self.expectation.take() {
            self.expectation = Some(exp.times(n));
        }
        self
    }

    pub fn once(self) -> Self {
        self.times_kind(Times::Once)
    }

    pub fn never(self) -> Self {
        self.times(0)
    }

    pub fn any_times(mut self) -> Self {
        if let Some(exp) = self.expectation.take() {
            self.expectation = Some(exp.any_times());
        }
        self
    }

    fn times_kind(mut self, times: Times) -> Self {
        if let Some(exp) = self.expectation.as_mut() {
            exp.times = times;
        }
        self
    }
}

impl Drop for ExpectationBuilder {
    fn drop(&mut self) {
        if let Some(exp) = self.expectation.take() {
            let mut state = self.server.lock().unwrap();
            state.expectations.push(exp);
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<Mutex<ServerState>>,
) -> Result<Response<Full<Bytes>>> {
    let (parts, body) = req.into_parts();
    let body_bytes = body.collect().await?.to_bytes();

    let recorded = RecordedRequest {
        method: parts.method.clone(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers.clone(),
        body: body_bytes.clone(),
    };

    let matched = {
        let mut state_guard = state.lock().unwrap();
        state_guard.received.push(recorded.clone());

        // Later expectations override earlier ones
        let matching = state_guard.expectations.iter_mut().rev().find(|exp| {
            exp.matcher
                .matches(&parts.method, parts.uri.path(), &parts.headers, &body_bytes)
        });

        match matching {
            Some(exp) => {
                exp.call_count += 1;
                Some(exp.response.clone())
            }
            None => {
                state_guard.unmatched.push(recorded);
                None
            }
        }
    };

    let Some(resp_def) = matched else {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("No expectation matched")))?);
    };

    if let Some(delay) = resp_def.delay {
        tokio::time::sleep(delay).await;
    }

    let mut response = Response::builder().status(resp_def.status);
    for (k, v) in &resp_def.headers {
        response = response.header(k, v);
    }
    Ok(response.body(Full::new(resp_def.body))?)
}
