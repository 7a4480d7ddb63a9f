// src/telemetry/mod.rs - Temperature telemetry: message decoding, fan-out hub, feed connection
pub mod feed;
pub mod hub;

pub use feed::{run_feed, FeedConnector, FeedStream, ReconnectPolicy, TcpLineFeed};
pub use hub::{run_health_check, ConnectionStatus, FeedHealth, TelemetryHub, TelemetrySubscription};

use crate::error::MalformedDataError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

/// Payload key carrying an already-scaled temperature.
pub const PROCESSED_TEMPERATURE_KEY: &str = "/processdatamaster/temperature";
/// Payload key carrying the sensor's raw process data as hex (tenths of °F).
pub const RAW_TEMPERATURE_KEY: &str = "/iolinkmaster/port[6]/iolinkdevice/pdin";

/// One message as delivered by the feed or POSTed to the ingest route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedMessage {
    pub topic: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureSample {
    pub device: String,
    /// °F, always positive
    pub value: f64,
    pub timestamp: Option<String>,
    pub received_at: Instant,
}

/// Lowercase with dashes folded into underscores, so `HTR-A` matches `htr_a`.
pub fn normalize_device(name: &str) -> String {
    name.to_ascii_lowercase().replace('-', "_")
}

/// `decimal(hex) / 10`, e.g. `"05DC"` is 150.0°F.
pub fn decode_hex_temperature(hex: &str) -> Result<f64, MalformedDataError> {
    let trimmed = hex.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let raw = u32::from_str_radix(digits, 16).map_err(|_| MalformedDataError::InvalidHex(hex.to_string()))?;
    Ok(raw as f64 / 10.0)
}

/// Find which known device a topic refers to.
pub fn device_from_topic(topic: &str, devices: &[String]) -> Option<String> {
    let topic = normalize_device(topic);
    devices
        .iter()
        .find(|device| topic.contains(&normalize_device(device)))
        .cloned()
}

fn numeric(value: &Value) -> Result<f64, MalformedDataError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or(MalformedDataError::NotNumeric),
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| MalformedDataError::NotNumeric),
        _ => Err(MalformedDataError::NotNumeric),
    }
}

fn payload_entry<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
    payload.get("data")?.get("payload")?.get(key)?.get("data")
}

/// Extract a temperature sample from any of the supported payload layouts.
pub fn parse_message(message: &FeedMessage, devices: &[String], now: Instant) -> Result<TemperatureSample, MalformedDataError> {
    let payload = &message.payload;
    let value = if let Some(processed) = payload_entry(payload, PROCESSED_TEMPERATURE_KEY) {
        numeric(processed)?
    } else if let Some(raw) = payload_entry(payload, RAW_TEMPERATURE_KEY) {
        match raw {
            Value::String(hex) => decode_hex_temperature(hex)?,
            _ => return Err(MalformedDataError::InvalidHex(raw.to_string())),
        }
    } else if let Some(direct) = payload.get("temperature") {
        numeric(direct)?
    } else {
        return Err(MalformedDataError::MissingTemperature);
    };

    if !value.is_finite() || value <= 0.0 {
        return Err(MalformedDataError::NonPositive(value));
    }

    let device = match payload.get("device_type").and_then(Value::as_str) {
        Some(declared) => {
            let key = normalize_device(declared);
            devices
                .iter()
                .find(|d| normalize_device(d) == key)
                .cloned()
                .unwrap_or_else(|| declared.to_string())
        }
        None => device_from_topic(&message.topic, devices)
            .ok_or_else(|| MalformedDataError::UnknownDevice(message.topic.clone()))?,
    };

    Ok(TemperatureSample {
        device,
        value,
        timestamp: payload.get("timestamp").and_then(Value::as_str).map(str::to_string),
        received_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn devices() -> Vec<String> {
        vec!["HTR-A".to_string(), "HTR-B".to_string()]
    }

    fn message(topic: &str, payload: Value) -> FeedMessage {
        FeedMessage {
            topic: topic.to_string(),
            payload,
        }
    }

    #[test]
    fn test_decode_hex() {
        assert_eq!(decode_hex_temperature("05DC").unwrap(), 150.0);
        assert_eq!(decode_hex_temperature("0x03e8").unwrap(), 100.0);
        assert!(matches!(decode_hex_temperature("zz"), Err(MalformedDataError::InvalidHex(_))));
        assert!(decode_hex_temperature("").is_err());
    }

    #[test]
    fn test_processed_temperature() {
        let msg = message(
            "instruments_ti",
            json!({"device_type": "HTR-A", "data": {"payload": {"/processdatamaster/temperature": {"data": 212.5}}}}),
        );
        let sample = parse_message(&msg, &devices(), Instant::now()).unwrap();
        assert_eq!(sample.device, "HTR-A");
        assert_eq!(sample.value, 212.5);
    }

    #[test]
    fn test_raw_hex_temperature_from_topic() {
        let msg = message(
            "instrument/htr_b",
            json!({"data": {"payload": {"/iolinkmaster/port[6]/iolinkdevice/pdin": {"data": "0834"}}}}),
        );
        let sample = parse_message(&msg, &devices(), Instant::now()).unwrap();
        assert_eq!(sample.device, "HTR-B");
        assert_eq!(sample.value, 210.0);
    }

    #[test]
    fn test_direct_temperature() {
        let msg = message(
            "instrument/unit1/htr-a/temperature",
            json!({"temperature": 98.6, "timestamp": "2024-05-01T12:00:00Z"}),
        );
        let sample = parse_message(&msg, &devices(), Instant::now()).unwrap();
        assert_eq!(sample.device, "HTR-A");
        assert_eq!(sample.timestamp.as_deref(), Some("2024-05-01T12:00:00Z"));
    }

    #[test]
    fn test_declared_device_matches_loosely() {
        let msg = message("anything", json!({"device_type": "htr_b", "temperature": 120}));
        assert_eq!(parse_message(&msg, &devices(), Instant::now()).unwrap().device, "HTR-B");
    }

    #[test]
    fn test_invalid_messages_rejected() {
        let now = Instant::now();
        let cases = [
            message("instrument/htr_a", json!({"temperature": 0})),
            message("instrument/htr_a", json!({"temperature": -12.0})),
            message("instrument/htr_a", json!({"temperature": "hot"})),
            message("instrument/htr_a", json!({"status": "ok"})),
            message("instrument/htr_a", json!({"data": {"payload": {"/iolinkmaster/port[6]/iolinkdevice/pdin": {"data": "xyz"}}}})),
            message("instrument/unknown", json!({"temperature": 100.0})),
        ];
        for msg in cases {
            assert!(parse_message(&msg, &devices(), now).is_err(), "accepted {:?}", msg);
        }
    }
}
