//! Middleware client against a stub HTTP server

use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::Router;
use parking_lot::Mutex;
use serde_json::{json, Value};
use somiod_reactor::config::MiddlewareConfig;
use somiod_reactor::middleware::DISCOVERY_HEADER;
use somiod_reactor::{runtime, Config, MiddlewareClient, MiddlewareError, ResourceHandle};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
struct Request {
    method: Method,
    path: String,
    discovery: Option<String>,
    body: String,
}

impl Request {
    fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::Null)
    }
}

/// Canned answers keyed by "METHOD path"; unknown routes answer 404
#[derive(Clone, Default)]
struct Stub {
    routes: Arc<Mutex<HashMap<String, (StatusCode, String)>>>,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl Stub {
    fn route(&self, method: Method, path: &str, status: StatusCode, body: Value) -> &Self {
        let body = if body.is_null() { String::new() } else { body.to_string() };
        self.routes
            .lock()
            .insert(format!("{method} {path}"), (status, body));
        self
    }

    fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    fn lines(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|r| format!("{} {}", r.method, r.path))
            .collect()
    }

    async fn serve(&self) -> MiddlewareClient {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().fallback(answer).with_state(self.clone());
        tokio::spawn(async move { axum::serve(listener, app).await });

        MiddlewareClient::new(&MiddlewareConfig {
            base_url: format!("http://{addr}"),
            timeout_secs: 5,
            ..MiddlewareConfig::default()
        })
        .unwrap()
    }
}

async fn answer(
    State(stub): State<Stub>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, String) {
    let path = uri.path().to_string();
    stub.requests.lock().push(Request {
        method: method.clone(),
        path: path.clone(),
        discovery: headers
            .get(DISCOVERY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });

    stub.routes
        .lock()
        .get(&format!("{method} {path}"))
        .cloned()
        .unwrap_or((StatusCode::NOT_FOUND, "not found".to_string()))
}

#[tokio::test]
async fn create_application_posts_name() {
    let stub = Stub::default();
    stub.route(
        Method::POST,
        "/api/somiod",
        StatusCode::CREATED,
        json!({ "resource_name": "dashboard-b", "creation_datetime": "2024-01-01T00:00:00" }),
    );
    let client = stub.serve().await;

    let record = client.create_application("dashboard-b").await.unwrap();
    assert_eq!(record.name(), "dashboard-b");
    assert_eq!(record.creation_datetime.as_deref(), Some("2024-01-01T00:00:00"));

    let requests = stub.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].json(), json!({ "resource_name": "dashboard-b" }));
}

#[tokio::test]
async fn existing_application_is_fetched_on_conflict() {
    let stub = Stub::default();
    stub.route(Method::POST, "/api/somiod", StatusCode::CONFLICT, json!({ "error": "exists" }))
        .route(
            Method::GET,
            "/api/somiod/dashboard-b",
            StatusCode::OK,
            json!({ "resource_name": "dashboard-b", "creation_datetime": "2023-12-31T08:00:00" }),
        );
    let client = stub.serve().await;

    let record = client.create_application("dashboard-b").await.unwrap();
    assert_eq!(record.creation_datetime.as_deref(), Some("2023-12-31T08:00:00"));
    assert_eq!(stub.lines(), ["POST /api/somiod", "GET /api/somiod/dashboard-b"]);
}

#[tokio::test]
async fn existing_container_is_fetched_on_conflict() {
    let stub = Stub::default();
    stub.route(Method::POST, "/api/somiod/dashboard-b", StatusCode::CONFLICT, Value::Null)
        .route(
            Method::GET,
            "/api/somiod/dashboard-b/commands",
            StatusCode::OK,
            json!({ "resource_name": "commands" }),
        );
    let client = stub.serve().await;

    let record = client.create_container("dashboard-b", "commands").await.unwrap();
    assert_eq!(record.name(), "commands");
    assert_eq!(
        stub.lines(),
        ["POST /api/somiod/dashboard-b", "GET /api/somiod/dashboard-b/commands"]
    );
    assert_eq!(stub.requests()[0].json(), json!({ "resource_name": "commands" }));
}

#[tokio::test]
async fn existing_subscription_is_fetched_on_conflict() {
    let stub = Stub::default();
    stub.route(
        Method::POST,
        "/api/somiod/temp-sensor-001/readings/subs",
        StatusCode::CONFLICT,
        Value::Null,
    )
    .route(
        Method::GET,
        "/api/somiod/temp-sensor-001/readings/subs/sub-dash",
        StatusCode::OK,
        json!({ "resource_name": "sub-dash", "evt": "1", "endpoint": "mqtt://127.0.0.1:1883" }),
    );
    let client = stub.serve().await;

    let record = client
        .create_subscription("temp-sensor-001", "readings", "sub-dash", 1, "mqtt://127.0.0.1:1883")
        .await
        .unwrap();
    assert_eq!(record.evt, Some(1));
    assert_eq!(record.endpoint.as_deref(), Some("mqtt://127.0.0.1:1883"));

    let requests = stub.requests();
    assert_eq!(
        requests[0].json(),
        json!({ "resource_name": "sub-dash", "evt": 1, "endpoint": "mqtt://127.0.0.1:1883" })
    );
    assert_eq!(requests[1].path, "/api/somiod/temp-sensor-001/readings/subs/sub-dash");
}

#[tokio::test]
async fn conflict_on_fallback_fetch_is_not_retried() {
    let stub = Stub::default();
    stub.route(Method::POST, "/api/somiod", StatusCode::CONFLICT, Value::Null)
        .route(Method::GET, "/api/somiod/dashboard-b", StatusCode::CONFLICT, Value::Null);
    let client = stub.serve().await;

    let result = client.create_application("dashboard-b").await;
    assert!(matches!(result, Err(MiddlewareError::Conflict(_))));
    assert_eq!(stub.requests().len(), 2);
}

#[tokio::test]
async fn error_status_keeps_method_and_body() {
    let stub = Stub::default();
    stub.route(
        Method::POST,
        "/api/somiod/temp-sensor-001/readings",
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "error": "db down" }),
    );
    let client = stub.serve().await;

    match client.get_container("temp-sensor-001", "readings").await {
        Err(MiddlewareError::Status { method, status, url, .. }) => {
            assert_eq!(method, "GET");
            assert_eq!(status, 404);
            assert!(url.ends_with("/api/somiod/temp-sensor-001/readings"));
        }
        other => panic!("expected 404, got {other:?}"),
    }

    let handle = ResourceHandle::new("temp-sensor-001", "readings", "cmd-1");
    match client.post_content_instance(&handle, "application/xml", "<cmd>FAN_ON</cmd>").await {
        Err(MiddlewareError::Status { method, status, body, .. }) => {
            assert_eq!(method, "POST");
            assert_eq!(status, 500);
            assert!(body.contains("db down"));
        }
        other => panic!("expected 500, got {other:?}"),
    }
}

#[tokio::test]
async fn non_object_body_is_invalid() {
    let stub = Stub::default();
    stub.route(
        Method::GET,
        "/api/somiod/temp-sensor-001/readings/reading-1",
        StatusCode::OK,
        json!(["reading-1"]),
    );
    let client = stub.serve().await;

    let handle = ResourceHandle::new("temp-sensor-001", "readings", "reading-1");
    let result = client.get_content_instance(&handle).await;
    assert!(matches!(result, Err(MiddlewareError::InvalidBody { .. })));
}

#[tokio::test]
async fn content_instance_names_are_escaped_on_the_wire() {
    let stub = Stub::default();
    let client = stub.serve().await;

    let handle = ResourceHandle::new("temp-sensor-001", "readings", "../../dashboard-b");
    let _ = client.get_content_instance(&handle).await;
    let handle = ResourceHandle::new("temp-sensor-001", "readings", "reading?x=1");
    let _ = client.get_content_instance(&handle).await;

    assert_eq!(
        stub.lines(),
        [
            "GET /api/somiod/temp-sensor-001/readings/..%2F..%2Fdashboard-b",
            "GET /api/somiod/temp-sensor-001/readings/reading%3Fx=1",
        ]
    );
}

#[tokio::test]
async fn discovery_sends_header_and_reads_names() {
    let stub = Stub::default();
    stub.route(
        Method::GET,
        "/api/somiod",
        StatusCode::OK,
        json!(["temp-sensor-001", { "resource_name": "dashboard-b" }, 7]),
    )
    .route(
        Method::GET,
        "/api/somiod/temp-sensor-001/readings",
        StatusCode::OK,
        json!(["reading-1", "reading-2"]),
    );
    let client = stub.serve().await;

    let apps = client.discover_applications().await.unwrap();
    assert_eq!(apps, ["temp-sensor-001", "dashboard-b"]);
    let readings = client
        .discover_content_instances("temp-sensor-001", "readings")
        .await
        .unwrap();
    assert_eq!(readings, ["reading-1", "reading-2"]);

    let discovery: Vec<_> = stub.requests().into_iter().map(|r| r.discovery).collect();
    assert_eq!(
        discovery,
        [Some("application".to_string()), Some("content-instance".to_string())]
    );
}

#[tokio::test]
async fn delete_application_accepts_empty_body() {
    let stub = Stub::default();
    stub.route(Method::DELETE, "/api/somiod/dashboard-b", StatusCode::NO_CONTENT, Value::Null);
    let client = stub.serve().await;

    client.delete_application("dashboard-b").await.unwrap();
    assert!(matches!(
        client.delete_application("gone").await,
        Err(MiddlewareError::Status { status: 404, .. })
    ));
    assert_eq!(
        stub.lines(),
        ["DELETE /api/somiod/dashboard-b", "DELETE /api/somiod/gone"]
    );
}

#[tokio::test]
async fn register_creates_application_then_subscription() {
    let stub = Stub::default();
    stub.route(Method::POST, "/api/somiod", StatusCode::CREATED, Value::Null)
        .route(
            Method::POST,
            "/api/somiod/temp-sensor-001/readings/subs",
            StatusCode::CONFLICT,
            Value::Null,
        )
        .route(
            Method::GET,
            "/api/somiod/temp-sensor-001/readings/subs/sub-dash",
            StatusCode::OK,
            json!({ "resource_name": "sub-dash", "evt": 1 }),
        );
    let client = stub.serve().await;

    let mut config = Config::default();
    config.mqtt.broker_host = "broker.lan".into();
    config.mqtt.broker_port = 1884;
    runtime::register(&client, &config).await.unwrap();

    assert_eq!(
        stub.lines(),
        [
            "POST /api/somiod",
            "POST /api/somiod/temp-sensor-001/readings/subs",
            "GET /api/somiod/temp-sensor-001/readings/subs/sub-dash",
        ]
    );
    let requests = stub.requests();
    assert_eq!(requests[0].json(), json!({ "resource_name": "dashboard-b" }));
    assert_eq!(
        requests[1].json(),
        json!({ "resource_name": "sub-dash", "evt": 1, "endpoint": "mqtt://broker.lan:1884" })
    );
}

#[tokio::test]
async fn register_stops_when_application_fails() {
    let stub = Stub::default();
    stub.route(Method::POST, "/api/somiod", StatusCode::SERVICE_UNAVAILABLE, Value::Null);
    let client = stub.serve().await;

    let result = runtime::register(&client, &Config::default()).await;
    assert!(matches!(result, Err(MiddlewareError::Status { status: 503, .. })));
    assert_eq!(stub.lines(), ["POST /api/somiod"]);
}
