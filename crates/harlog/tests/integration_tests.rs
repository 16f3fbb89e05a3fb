//! End-to-end tests: the middleware in front of a service, shipping to a
//! mock collector and resolving its base URL from a mock account API.

use bytes::Bytes;
use harlog::account::MemoryCacheStore;
use harlog::layer::RequestBody;
use harlog::prelude::{Group, MetricsLayer, MetricsOptions, DOCUMENTATION_URL};
use harlog_testing::{MockResponse, MockServer, RecordedRequest, RequestMatcher};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower::{service_fn, Layer, ServiceExt};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn handler(req: Request<RequestBody>) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let body = req.into_body().collect().await.unwrap().to_bytes();

    let response = match path.as_str() {
        "/pets" => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json; charset=utf-8")
            .body(Full::new(Bytes::from(r#"[{"id":1,"name":"Buster"}]"#))),
        "/echo" => Response::builder()
            .status(StatusCode::CREATED)
            .header("content-type", "application/json")
            .body(Full::new(body)),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from("not found"))),
    };
    Ok(response.unwrap())
}

async fn start_backend() -> MockServer {
    let server = MockServer::start().await;
    server
        .expect(
            RequestMatcher::new()
                .method(Method::POST)
                .path("/v1/request")
                .basic_auth("project-key", ""),
        )
        .respond_with(MockResponse::new().status(StatusCode::ACCEPTED))
        .any_times();
    server
        .expect(
            RequestMatcher::new()
                .method(Method::GET)
                .path("/v1/")
                .basic_auth("project-key", ""),
        )
        .respond_with(
            MockResponse::new().json(serde_json::json!({"baseUrl": "https://docs.example.com"})),
        )
        .any_times();
    server
}

fn options(server: &MockServer) -> MetricsOptions {
    MetricsOptions::new("project-key")
        .collector_url(server.base_url())
        .account_api_url(server.base_url())
        .timeout(Duration::from_secs(2))
}

fn build(options: MetricsOptions) -> MetricsLayer {
    MetricsLayer::builder(options)
        .grouping(|parts| {
            let user = parts.headers.get("x-user")?.to_str().ok()?;
            Some(Group::new().id(user).email(format!("{}@example.com", user)))
        })
        .cache_store(Arc::new(MemoryCacheStore::new()))
        .build()
        .unwrap()
}

async fn send(metrics: &MetricsLayer, request: Request<Full<Bytes>>) -> Response<Bytes> {
    let response = metrics
        .layer(service_fn(handler))
        .oneshot(request)
        .await
        .unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    Response::from_parts(parts, body)
}

fn batches(received: &[RecordedRequest]) -> Vec<Vec<Value>> {
    received
        .iter()
        .filter(|r| r.path == "/v1/request")
        .map(|r| match r.body_json() {
            Some(Value::Array(items)) => items,
            other => panic!("collector body is not an array: {:?}", other),
        })
        .collect()
}

async fn wait_for_batches(server: &MockServer, n: usize) -> Vec<Vec<Value>> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let found = batches(&server.received_requests());
        if found.len() >= n || tokio::time::Instant::now() >= deadline {
            return found;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn get(uri: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .uri(uri)
        .header("host", "api.example.com")
        .header("x-user", "owlbert")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[tokio::test]
async fn test_batches_reach_collector() {
    init_tracing();
    let server = start_backend().await;
    let metrics = build(options(&server).buffer_length(2));

    let first = send(&metrics, get("/pets?limit=1")).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.body(), &Bytes::from(r#"[{"id":1,"name":"Buster"}]"#));
    send(&metrics, get("/missing")).await;

    let batches = wait_for_batches(&server, 1).await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);

    let payload = &batches[0][0];
    assert_eq!(
        payload["group"],
        serde_json::json!({"id": "owlbert", "email": "owlbert@example.com"})
    );
    let entry = &payload["request"]["log"]["entries"][0];
    assert_eq!(entry["request"]["method"], "GET");
    assert_eq!(entry["request"]["url"], "http://api.example.com/pets?limit=1");
    assert_eq!(
        entry["request"]["queryString"],
        serde_json::json!([{"name": "limit", "value": "1"}])
    );
    assert_eq!(
        entry["response"]["content"]["mimeType"],
        "application/json; charset=utf-8"
    );
    assert_eq!(entry["response"]["content"]["size"], 26);

    let second = &batches[0][1]["request"]["log"]["entries"][0];
    assert_eq!(second["response"]["status"], 404);
    assert_eq!(second["response"]["content"]["text"], "not found");
}

#[tokio::test]
async fn test_documentation_url_from_account_api() {
    init_tracing();
    let server = start_backend().await;
    let metrics = build(options(&server).buffer_length(1));

    let response = send(&metrics, get("/pets")).await;
    let doc_url = response
        .headers()
        .get(DOCUMENTATION_URL)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(doc_url.starts_with("https://docs.example.com/logs/"));

    // The cached base URL serves the second request.
    send(&metrics, get("/pets")).await;
    let account_calls = server
        .received_requests()
        .iter()
        .filter(|r| r.path == "/v1/")
        .count();
    assert_eq!(account_calls, 1);

    let batches = wait_for_batches(&server, 2).await;
    let id = batches[0][0]["_id"].as_str().unwrap().to_string();
    let ids: Vec<&str> = batches.iter().map(|b| b[0]["_id"].as_str().unwrap()).collect();
    assert!(ids.iter().any(|i| doc_url.ends_with(i)), "{} not in {:?}", id, ids);
}

#[tokio::test]
async fn test_deny_list_redacts_json_body() {
    init_tracing();
    let server = start_backend().await;
    let metrics = build(
        options(&server)
            .buffer_length(1)
            .base_log_url("https://docs.example.com")
            .denylist(["password", "apiKey"]),
    );

    let request = Request::builder()
        .method(Method::POST)
        .uri("/echo")
        .header("host", "api.example.com")
        .header("x-user", "owlbert")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(
            r#"{"password":"123456","apiKey":"abc","another":"Hello world"}"#,
        )))
        .unwrap();
    let response = send(&metrics, request).await;

    // The client still gets the real body back.
    assert_eq!(
        response.body(),
        &Bytes::from(r#"{"password":"123456","apiKey":"abc","another":"Hello world"}"#)
    );

    let batches = wait_for_batches(&server, 1).await;
    let entry = &batches[0][0]["request"]["log"]["entries"][0];
    assert_eq!(
        entry["request"]["postData"]["text"],
        r#"{"password":"[REDACTED 6]","apiKey":"[REDACTED 3]","another":"Hello world"}"#
    );
    assert_eq!(
        entry["response"]["content"]["text"],
        r#"{"password":"[REDACTED 6]","apiKey":"[REDACTED 3]","another":"Hello world"}"#
    );

    // No account lookup when a base log URL is configured.
    assert!(server
        .received_requests()
        .iter()
        .all(|r| r.path != "/v1/"));
}

#[tokio::test]
async fn test_plain_get_has_no_post_data() {
    init_tracing();
    let server = start_backend().await;
    let metrics = build(
        options(&server)
            .buffer_length(1)
            .base_log_url("https://docs.example.com"),
    );

    send(&metrics, get("/pets")).await;

    let batches = wait_for_batches(&server, 1).await;
    let request = &batches[0][0]["request"]["log"]["entries"][0]["request"];
    assert_eq!(request["queryString"], serde_json::json!([]));
    assert!(request.get("postData").is_none());
}

#[tokio::test]
async fn test_ungrouped_requests_are_not_logged() {
    init_tracing();
    let server = start_backend().await;
    let metrics = build(
        options(&server)
            .buffer_length(1)
            .base_log_url("https://docs.example.com"),
    );

    let anonymous = Request::builder()
        .uri("/pets")
        .header("host", "api.example.com")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = send(&metrics, anonymous).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(DOCUMENTATION_URL).is_none());

    metrics.logger().shutdown().await;
    assert!(batches(&server.received_requests()).is_empty());
}

#[tokio::test]
async fn test_collector_failure_does_not_affect_responses() {
    init_tracing();
    let server = MockServer::start().await;
    server
        .expect(RequestMatcher::new().path("/v1/request"))
        .respond_with(MockResponse::new().status(StatusCode::INTERNAL_SERVER_ERROR))
        .any_times();

    let metrics = build(
        options(&server)
            .buffer_length(1)
            .base_log_url("https://docs.example.com"),
    );

    let response = send(&metrics, get("/pets")).await;
    assert_eq!(response.status(), StatusCode::OK);

    metrics.logger().shutdown().await;
    assert_eq!(batches(&server.received_requests()).len(), 1);
}

#[tokio::test]
async fn test_shutdown_flushes_partial_batch() {
    init_tracing();
    let server = start_backend().await;
    let metrics = build(
        options(&server)
            .buffer_length(10)
            .base_log_url("https://docs.example.com"),
    );

    for _ in 0..3 {
        send(&metrics, get("/pets")).await;
    }
    assert!(batches(&server.received_requests()).is_empty());
    assert_eq!(metrics.logger().queue().len(), 3);

    metrics.logger().shutdown().await;
    let batches = batches(&server.received_requests());
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 3);
}

#[cfg(feature = "webhook")]
#[test]
fn test_webhook_round_trip() {
    use harlog::webhook::{sign, verify, WebhookError};

    let body = r#"{"email":"owlbert@example.com"}"#;
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    let signature = sign(body, "secret", now);

    assert_eq!(verify(body, Some(&signature), "secret").unwrap(), body);
    assert!(matches!(
        verify(body, Some(&signature), "other"),
        Err(WebhookError::InvalidSignature)
    ));
}
