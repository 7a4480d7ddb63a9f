//! Integration tests for the heater web API

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use htr_cascade::controller::{self, InstanceDeps, InstanceSettings};
use htr_cascade::gateway::MemoryGateway;
use htr_cascade::setpoint::SetpointSynchronizer;
use htr_cascade::store::MemoryStateStore;
use htr_cascade::telemetry::TelemetryHub;
use htr_cascade::web::api::{create_router, AppStateInner};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::Duration;
use tower::util::ServiceExt; // for `oneshot`
use http_body_util::BodyExt; // for .collect().await

async fn test_app() -> Router {
    let gateway = Arc::new(MemoryGateway::new());
    let store = Arc::new(MemoryStateStore::new());
    let hub = Arc::new(TelemetryHub::new(
        vec!["HTR-A".to_string(), "HTR-B".to_string()],
        Duration::from_secs(30),
    ));
    let deps = InstanceDeps {
        gateway,
        poller: None,
        hub: hub.clone(),
        store: store.clone(),
        sync: Arc::new(SetpointSynchronizer::new(store, 750.0)),
    };
    let heaters = vec![
        controller::spawn(InstanceSettings::new("HTR-A", "192.168.30.29"), deps.clone()).await,
        controller::spawn(InstanceSettings::new("HTR-B", "192.168.30.33"), deps).await,
    ];
    create_router(Arc::new(AppStateInner { heaters, hub }))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(payload) => {
            builder = builder.header("content-type", "application/json");
            Body::from(payload.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_list_and_get_heaters() {
    let app = test_app().await;
    let (status, json) = send(&app, "GET", "/api/v1/heaters", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["heaters"].as_array().unwrap().len(), 2);

    let (status, json) = send(&app, "GET", "/api/v1/heaters/htr-b", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["name"], "HTR-B");
    assert_eq!(json["setpoint"], 150.0);
    assert_eq!(json["sections"], json!([false, false, false, false]));

    let (status, json) = send(&app, "GET", "/api/v1/heaters/HTR-Z", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("HTR-Z"));
}

#[tokio::test]
async fn test_setpoint_is_clamped() {
    let app = test_app().await;
    let (status, json) = send(&app, "POST", "/api/v1/heaters/HTR-A/setpoint", Some(json!({ "value": 900.0 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["setpoint"], 750.0);

    let (status, json) = send(&app, "POST", "/api/v1/heaters/HTR-A/setpoint", Some(json!({ "value": "hot" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_malformed_requests_get_json_errors() {
    let app = test_app().await;
    let (status, json) = send(&app, "POST", "/api/v1/heaters/HTR-A/sections/two", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());

    let (status, json) = send(&app, "POST", "/api/v1/heaters/HTR-A/timer", Some(json!({ "seconds": 30 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());

    // Missing content type
    let (status, json) = send(&app, "POST", "/api/v1/heaters/HTR-A/gains", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());

    let (status, json) = send(&app, "POST", "/api/v1/telemetry", Some(json!({ "topic": 5 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_auto_mode_locks_sections() {
    let app = test_app().await;
    let (status, json) = send(&app, "POST", "/api/v1/heaters/HTR-A/sections/2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({ "section": 2, "on": true }));

    let (status, json) = send(&app, "POST", "/api/v1/heaters/HTR-A/auto", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["is_auto"], true);

    let (status, json) = send(&app, "POST", "/api/v1/heaters/HTR-A/sections/2", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "Section 2 cannot be toggled while auto mode is active");

    let (status, _) = send(&app, "POST", "/api/v1/heaters/HTR-A/sections/5", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, "POST", "/api/v1/heaters/HTR-A/sections/0", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_gains_preset_and_explicit() {
    let app = test_app().await;
    let (status, json) = send(&app, "POST", "/api/v1/heaters/HTR-A/gains", Some(json!({ "preset": "stable" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({ "kp": 1.5, "ki": 0.02, "kd": 1.0 }));

    let (status, json) = send(
        &app,
        "POST",
        "/api/v1/heaters/HTR-A/gains",
        Some(json!({ "kp": 2.5, "ki": 0.1, "kd": 0.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["kp"], 2.5);

    let (status, _) = send(&app, "POST", "/api/v1/heaters/HTR-A/gains", Some(json!({ "kp": 2.5 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/heaters/HTR-A/gains",
        Some(json!({ "kp": -1.0, "ki": 0.1, "kd": 0.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_timer_range() {
    let app = test_app().await;
    let (status, _) = send(&app, "POST", "/api/v1/heaters/HTR-A/timer", Some(json!({ "milliseconds": 1000 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = send(&app, "POST", "/api/v1/heaters/HTR-A/timer", Some(json!({ "milliseconds": 30000 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["milliseconds"], 30000);
}

#[tokio::test]
async fn test_telemetry_ingest_and_status() {
    let app = test_app().await;
    let (status, json) = send(&app, "GET", "/api/v1/telemetry/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], json!({ "state": "not_connected" }));
    assert_eq!(json["messages"], 0);

    let message = json!({
        "topic": "sensors/htr_a/temperature",
        "payload": { "temperature": 142.5 }
    });
    let (status, json) = send(&app, "POST", "/api/v1/telemetry", Some(message)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({ "device": "HTR-A", "value": 142.5 }));

    let negative = json!({
        "topic": "sensors/htr_a/temperature",
        "payload": { "temperature": -3.0 }
    });
    let (status, _) = send(&app, "POST", "/api/v1/telemetry", Some(negative)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, json) = send(&app, "GET", "/api/v1/telemetry/status", None).await;
    assert_eq!(json["messages"], 2);
    assert_eq!(json["malformed_messages"], 1);
}
