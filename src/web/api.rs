//! Defines the Axum API routes and handlers.

use crate::control::SECTION_COUNT;
use crate::controller::{ControlError, ControllerHandle};
use crate::telemetry::{FeedHealth, FeedMessage, TelemetryHub};
use crate::web::models::{
    AutoResponse, GainsRequest, HeaterListResponse, IngestResponse, SectionResponse, SetpointRequest,
    SetpointResponse, TimerRequest, TimerResponse,
};
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tokio::time::Duration;

/// Helper to create a JSON error response with a message and status code
fn json_error(message: &str, status: StatusCode) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn control_error(error: ControlError) -> Response {
    let status = match error {
        ControlError::AutoModeLocked { .. } => StatusCode::CONFLICT,
        ControlError::InvalidSection(_)
        | ControlError::TimerOutOfRange(_)
        | ControlError::InvalidSetpoint(_)
        | ControlError::InvalidGains(_) => StatusCode::BAD_REQUEST,
        ControlError::InstanceStopped => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(&error.to_string(), status)
}

/// Malformed path or body, reported in the same JSON shape as other errors.
fn bad_request(message: String) -> Response {
    json_error(&message, StatusCode::BAD_REQUEST)
}

fn unknown_heater(name: &str) -> Response {
    json_error(&format!("Unknown heater '{}'", name), StatusCode::NOT_FOUND)
}

pub struct AppStateInner {
    pub heaters: Vec<ControllerHandle>,
    pub hub: Arc<TelemetryHub>,
}

impl AppStateInner {
    pub fn heater(&self, name: &str) -> Option<&ControllerHandle> {
        self.heaters.iter().find(|h| h.name().eq_ignore_ascii_case(name))
    }
}

pub type AppState = Arc<AppStateInner>;

/// Creates the Axum router with all the API endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/heaters", get(list_heaters))
        .route("/api/v1/heaters/{name}", get(get_heater))
        .route("/api/v1/heaters/{name}/setpoint", post(set_setpoint))
        .route("/api/v1/heaters/{name}/auto", post(toggle_auto))
        .route("/api/v1/heaters/{name}/sections/{number}", post(toggle_section))
        .route("/api/v1/heaters/{name}/gains", post(set_gains))
        .route("/api/v1/heaters/{name}/timer", post(set_timer))
        .route("/api/v1/telemetry", post(ingest_telemetry))
        .route("/api/v1/telemetry/status", get(telemetry_status))
        .with_state(state)
}

async fn list_heaters(State(state): State<AppState>) -> Json<HeaterListResponse> {
    let heaters = state.heaters.iter().map(ControllerHandle::latest_snapshot).collect();
    Json(HeaterListResponse { heaters })
}

async fn get_heater(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(heater) = state.heater(&name) else {
        return unknown_heater(&name);
    };
    match heater.snapshot().await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => control_error(e),
    }
}

async fn set_setpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<SetpointRequest>, JsonRejection>,
) -> Response {
    let Some(heater) = state.heater(&name) else {
        return unknown_heater(&name);
    };
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(e) => return bad_request(e.body_text()),
    };
    match heater.set_setpoint(payload.value).await {
        Ok(setpoint) => (StatusCode::OK, Json(SetpointResponse { setpoint })).into_response(),
        Err(e) => control_error(e),
    }
}

async fn toggle_auto(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(heater) = state.heater(&name) else {
        return unknown_heater(&name);
    };
    match heater.toggle_auto().await {
        Ok(is_auto) => (StatusCode::OK, Json(AutoResponse { is_auto })).into_response(),
        Err(e) => control_error(e),
    }
}

/// Sections are numbered 1-4 on the wire.
async fn toggle_section(
    State(state): State<AppState>,
    path: Result<Path<(String, usize)>, PathRejection>,
) -> Response {
    let Path((name, number)) = match path {
        Ok(path) => path,
        Err(e) => return bad_request(e.body_text()),
    };
    let Some(heater) = state.heater(&name) else {
        return unknown_heater(&name);
    };
    if number == 0 || number > SECTION_COUNT {
        return json_error(
            &format!("Section must be between 1 and {}", SECTION_COUNT),
            StatusCode::BAD_REQUEST,
        );
    }
    match heater.toggle_section(number - 1).await {
        Ok(on) => (StatusCode::OK, Json(SectionResponse { section: number, on })).into_response(),
        Err(e) => control_error(e),
    }
}

async fn set_gains(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<GainsRequest>, JsonRejection>,
) -> Response {
    let Some(heater) = state.heater(&name) else {
        return unknown_heater(&name);
    };
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(e) => return bad_request(e.body_text()),
    };
    let Some(gains) = payload.gains() else {
        return json_error("Provide either a preset or kp, ki and kd", StatusCode::BAD_REQUEST);
    };
    match heater.set_gains(gains).await {
        Ok(gains) => (StatusCode::OK, Json(gains)).into_response(),
        Err(e) => control_error(e),
    }
}

async fn set_timer(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<TimerRequest>, JsonRejection>,
) -> Response {
    let Some(heater) = state.heater(&name) else {
        return unknown_heater(&name);
    };
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(e) => return bad_request(e.body_text()),
    };
    match heater.set_timer_size(Duration::from_millis(payload.milliseconds)).await {
        Ok(timer_size) => (
            StatusCode::OK,
            Json(TimerResponse {
                milliseconds: timer_size.as_millis() as u64,
            }),
        )
            .into_response(),
        Err(e) => control_error(e),
    }
}

async fn ingest_telemetry(State(state): State<AppState>, message: Result<Json<FeedMessage>, JsonRejection>) -> Response {
    let Json(message) = match message {
        Ok(message) => message,
        Err(e) => return bad_request(e.body_text()),
    };
    match state.hub.ingest(&message) {
        Ok(sample) => (
            StatusCode::OK,
            Json(IngestResponse {
                device: sample.device,
                value: sample.value,
            }),
        )
            .into_response(),
        Err(e) => json_error(&e.to_string(), StatusCode::BAD_REQUEST),
    }
}

async fn telemetry_status(State(state): State<AppState>) -> Json<FeedHealth> {
    Json(state.hub.health())
}
