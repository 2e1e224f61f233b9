//! `ApiClient` and `TokenAuth` against an in-process HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::Mutex;

use uplink_core::{
    ApiClient, AuthProvider, Error, IDEMPOTENCY_HEADER, IngestClient, TokenAuth, TokenSet,
    now_millis,
};
use uplink_store::{DeviceState, Event, SensorReading};
use uplink_types::NetworkKind;

#[derive(Debug, Clone)]
struct Captured {
    path: &'static str,
    authorization: Option<String>,
    idempotency_key: Option<String>,
    body: Value,
}

#[derive(Default)]
struct Server {
    captured: Mutex<Vec<Captured>>,
    status: Mutex<Option<(StatusCode, Value)>>,
    delay: Mutex<Option<Duration>>,
}

type Shared = Arc<Server>;

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

async fn record(
    state: &Shared,
    path: &'static str,
    headers: &HeaderMap,
    body: Value,
) -> axum::response::Response {
    let delay = *state.delay.lock().await;
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    state.captured.lock().await.push(Captured {
        path,
        authorization: header(headers, "authorization"),
        idempotency_key: header(headers, IDEMPOTENCY_HEADER),
        body,
    });
    match state.status.lock().await.clone() {
        Some((status, body)) => (status, Json(body)).into_response(),
        None => Json(json!({"message": "ok", "count": 2})).into_response(),
    }
}

async fn sensor(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    record(&state, "sensor", &headers, body).await
}

async fn event(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    record(&state, "event", &headers, body).await
}

async fn device_state(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    record(&state, "device-state", &headers, body).await
}

async fn refresh(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    let reject = body["refreshToken"] != "refresh-ok";
    record(&state, "refresh", &headers, body).await;
    if reject {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid refresh token"})));
    }
    (
        StatusCode::OK,
        Json(json!({"idToken": "fresh-id", "expiresIn": 3600})),
    )
}

async fn login(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    record(&state, "login", &headers, body).await;
    Json(json!({"idToken": "id-1", "refreshToken": "refresh-ok", "expiresIn": 3600}))
}

async fn spawn_server() -> (String, Shared) {
    let state: Shared = Arc::new(Server::default());
    let app = Router::new()
        .route("/v1/data/sensor", post(sensor))
        .route("/v1/data/event", post(event))
        .route("/v1/data/device-state", post(device_state))
        .route("/v1/auth/refresh", post(refresh))
        .route("/v1/auth/login", post(login))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/v1"), state)
}

fn client(base_url: &str) -> ApiClient {
    ApiClient::new(base_url, "study-42", Duration::from_secs(5)).unwrap()
}

fn reading(ts: i64) -> SensorReading {
    let payload = json!({"x": 1.0}).as_object().cloned().unwrap();
    let metadata = json!({"accuracy": 3, "sampling_rate_hz": 5})
        .as_object()
        .cloned()
        .unwrap();
    SensorReading::new("p1", "accelerometer", ts, payload).with_metadata(metadata)
}

#[tokio::test]
async fn test_sensor_upload_sends_headers_and_body() {
    let (base, server) = spawn_server().await;
    let receipt = client(&base)
        .submit_sensor_readings("Bearer abc", "batch-1", "accelerometer", &[reading(1), reading(2)])
        .await
        .unwrap();

    assert_eq!(receipt.message, "ok");
    assert_eq!(receipt.count, Some(2));

    let captured = server.captured.lock().await.clone();
    assert_eq!(captured.len(), 1);
    let call = &captured[0];
    assert_eq!(call.path, "sensor");
    assert_eq!(call.authorization.as_deref(), Some("Bearer abc"));
    assert_eq!(call.idempotency_key.as_deref(), Some("batch-1"));
    assert_eq!(call.body["sensorType"], "accelerometer");
    assert_eq!(call.body["studyCode"], "study-42");
    assert_eq!(call.body["readings"][1]["timestamp"], 2);
    assert_eq!(call.body["readings"][0]["accuracy"], 3);
}

#[tokio::test]
async fn test_event_and_device_state_bodies() {
    let (base, server) = spawn_server().await;
    let client = client(&base);

    let props = json!({"screen": "home"}).as_object().cloned().unwrap();
    let event = Event::new("p1", "app_open", 10).with_properties(props);
    client.submit_events("Bearer t", "b-e", &[event]).await.unwrap();

    let state = DeviceState::new("p1", 20, 55, true, NetworkKind::Wifi);
    client
        .submit_device_states("Bearer t", "b-d", &[state])
        .await
        .unwrap();

    let captured = server.captured.lock().await.clone();
    assert_eq!(captured[0].path, "event");
    assert_eq!(captured[0].body["events"][0]["eventType"], "app_open");
    assert_eq!(captured[0].body["events"][0]["metadata"]["screen"], "home");
    assert_eq!(captured[1].path, "device-state");
    assert_eq!(captured[1].body["states"][0]["batteryLevel"], 55);
    assert_eq!(captured[1].body["states"][0]["isCharging"], true);
    assert_eq!(captured[1].body["states"][0]["networkType"], "wifi");
}

#[tokio::test]
async fn test_401_maps_to_unauthenticated() {
    let (base, server) = spawn_server().await;
    *server.status.lock().await = Some((StatusCode::UNAUTHORIZED, json!({"error": "expired"})));

    let result = client(&base)
        .submit_events("Bearer old", "b", &[Event::new("p1", "x", 1)])
        .await;
    assert!(matches!(result, Err(Error::Unauthenticated)));
}

#[tokio::test]
async fn test_server_error_carries_message() {
    let (base, server) = spawn_server().await;
    *server.status.lock().await = Some((
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"error": "database unavailable"}),
    ));

    let err = client(&base)
        .submit_sensor_readings("Bearer t", "b", "gyroscope", &[reading(1)])
        .await
        .unwrap_err();
    match err {
        Error::Api { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "database unavailable");
        }
        other => panic!("expected Api error, got {other:?}"),
    }
    assert!(Error::Api { status: 500, message: String::new() }.is_retryable());
}

#[tokio::test]
async fn test_refused_connection_is_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = client(&format!("http://{addr}"))
        .submit_events("Bearer t", "b", &[])
        .await;
    assert!(matches!(result, Err(Error::Network { .. })));
}

#[tokio::test]
async fn test_slow_server_times_out() {
    let (base, server) = spawn_server().await;
    *server.delay.lock().await = Some(Duration::from_secs(2));

    let client = ApiClient::new(&base, "s", Duration::from_millis(200)).unwrap();
    let result = client.submit_events("Bearer t", "b", &[]).await;
    assert!(matches!(result, Err(Error::Timeout { .. })));
}

#[tokio::test]
async fn test_token_refreshed_near_expiry() {
    let (base, server) = spawn_server().await;
    let tokens = TokenSet {
        id_token: "stale-id".into(),
        refresh_token: "refresh-ok".into(),
        expires_at: now_millis() + 60_000,
    };
    let auth = TokenAuth::new(&base, Duration::from_secs(5), Some(tokens)).unwrap();

    assert_eq!(
        auth.authorization_header().await.as_deref(),
        Some("Bearer fresh-id")
    );
    let refreshed = auth.tokens().await.unwrap();
    assert_eq!(refreshed.refresh_token, "refresh-ok");
    assert!(refreshed.expires_at > now_millis() + 3_000_000);

    let captured = server.captured.lock().await.clone();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].body["refreshToken"], "refresh-ok");
}

#[tokio::test]
async fn test_failed_refresh_logs_out() {
    let (base, _server) = spawn_server().await;
    let tokens = TokenSet {
        id_token: "stale-id".into(),
        refresh_token: "revoked".into(),
        expires_at: now_millis() - 1,
    };
    let auth = TokenAuth::new(&base, Duration::from_secs(5), Some(tokens)).unwrap();

    assert!(auth.authorization_header().await.is_none());
    assert!(!auth.is_logged_in().await);
}

#[tokio::test]
async fn test_login_persists_tokens() {
    let (base, _server) = spawn_server().await;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tokens.json");

    let auth = TokenAuth::load(&base, Duration::from_secs(5), &path).unwrap();
    assert!(!auth.is_logged_in().await);
    auth.login("user@example.org", "secret").await.unwrap();
    assert!(path.exists());

    let reloaded = TokenAuth::load(&base, Duration::from_secs(5), &path).unwrap();
    assert_eq!(
        reloaded.authorization_header().await.as_deref(),
        Some("Bearer id-1")
    );
}
