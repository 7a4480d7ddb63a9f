// src/error.rs - Error types shared by the telemetry feed and actuator gateway
use thiserror::Error;

/// Network failure talking to the telemetry feed or the actuator gateway.
///
/// Never mutates heater state; the next scheduled tick retries.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Unexpected status {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("Gateway reported an error for port {port}")]
    Gateway { port: u8 },
    #[error("Feed IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Feed connection closed")]
    Closed,
    #[error("Simulated failure: {0}")]
    Injected(String),
}

/// Unusable telemetry payload. Logged and discarded.
#[derive(Debug, Error)]
pub enum MalformedDataError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid hex temperature '{0}'")]
    InvalidHex(String),
    #[error("Temperature {0} is not a positive reading")]
    NonPositive(f64),
    #[error("Temperature value is not numeric")]
    NotNumeric,
    #[error("No temperature found in message")]
    MissingTemperature,
    #[error("Cannot determine device for topic '{0}'")]
    UnknownDevice(String),
}
