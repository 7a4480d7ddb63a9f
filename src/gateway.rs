// src/gateway.rs - Actuator gateway client (IO-Link port writes and read-backs)
use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// IO-Link ports wired to heater sections 1-4.
pub const SECTION_PORTS: [u8; 4] = [1, 2, 3, 4];
/// IO-Link port driving the pulse-width-modulated analog channel.
pub const ANALOG_PORT: u8 = 5;

/// Port number for a zero-based section index.
pub fn section_port(index: usize) -> u8 {
    SECTION_PORTS[index]
}

/// Outbound digital-output commands and channel read-back.
#[async_trait]
pub trait ActuatorGateway: Send + Sync {
    async fn set_port(&self, device_address: &str, port: u8, state: bool) -> Result<(), TransportError>;
    async fn read_port(&self, device_address: &str, port: u8) -> Result<bool, TransportError>;
}

/// Pull side of the telemetry feed.
#[async_trait]
pub trait TemperatureSource: Send + Sync {
    /// Raw value reported for `device_id`; validation is up to the caller.
    async fn fetch_temperature(&self, device_id: &str) -> Result<f64, TransportError>;
}

/// Send a port write without waiting for it. Failures are only logged.
pub fn spawn_set_port(
    gateway: Arc<dyn ActuatorGateway>,
    device_address: String,
    port: u8,
    state: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match gateway.set_port(&device_address, port, state).await {
            Ok(()) => tracing::debug!("Port {} on {} set to {}", port, device_address, state),
            Err(e) => tracing::warn!("Failed to set port {} on {} to {}: {}", port, device_address, state, e),
        }
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetDataRequest<'a> {
    state: bool,
    device_address: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetDataRequest<'a> {
    device_address: &'a str,
}

#[derive(Debug, Deserialize)]
struct GetDataResponse {
    status: String,
    #[serde(default)]
    response: Option<GetDataBody>,
}

#[derive(Debug, Deserialize)]
struct GetDataBody {
    #[serde(default)]
    data: Option<PortValue>,
}

#[derive(Debug, Deserialize)]
struct PortValue {
    value: String,
}

#[derive(Debug, Deserialize)]
struct TemperatureResponse {
    value: f64,
}

/// HTTP backend relaying commands to the IO-Link masters.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| TransportError::Http {
                url: base_url.to_string(),
                source,
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn port_url(&self, port: u8, action: &str) -> String {
        format!("{}/api/iolink/port/{}/{}", self.base_url, port, action)
    }

    async fn post_json<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<reqwest::Response, TransportError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|source| TransportError::Http {
                url: url.to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ActuatorGateway for HttpGateway {
    async fn set_port(&self, device_address: &str, port: u8, state: bool) -> Result<(), TransportError> {
        let url = self.port_url(port, "setdata");
        tracing::debug!("POST {} state={}", url, state);
        self.post_json(&url, &SetDataRequest { state, device_address }).await?;
        Ok(())
    }

    async fn read_port(&self, device_address: &str, port: u8) -> Result<bool, TransportError> {
        let url = self.port_url(port, "getdata");
        let response = self.post_json(&url, &GetDataRequest { device_address }).await?;
        let body: GetDataResponse = response
            .json()
            .await
            .map_err(|source| TransportError::Http { url: url.clone(), source })?;
        if body.status != "ok" {
            return Err(TransportError::Gateway { port });
        }
        match body.response.and_then(|r| r.data) {
            Some(data) => Ok(data.value == "01"),
            None => Err(TransportError::Gateway { port }),
        }
    }
}

#[async_trait]
impl TemperatureSource for HttpGateway {
    async fn fetch_temperature(&self, device_id: &str) -> Result<f64, TransportError> {
        let url = format!("{}/api/temperature/{}", self.base_url, device_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| TransportError::Http { url: url.clone(), source })?;
        if !response.status().is_success() {
            return Err(TransportError::Status {
                url,
                status: response.status().as_u16(),
            });
        }
        let body: TemperatureResponse = response
            .json()
            .await
            .map_err(|source| TransportError::Http { url: url.clone(), source })?;
        Ok(body.value)
    }
}

/// A single recorded port write.
#[derive(Debug, Clone, PartialEq)]
pub struct PortWrite {
    pub device_address: String,
    pub port: u8,
    pub state: bool,
}

#[derive(Debug, Default)]
struct MemoryGatewayInner {
    ports: HashMap<(String, u8), bool>,
    writes: Vec<PortWrite>,
    temperatures: HashMap<String, f64>,
    fail_reads: bool,
    fail_writes: bool,
    /// Apply writes without logging them.
    unlogged: bool,
}

/// In-process gateway used by the simulator and tests.
///
/// Writes are applied immediately, so read-backs always reflect the last write
/// unless a port was changed behind the controller's back with `force_port`.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    inner: Mutex<MemoryGatewayInner>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryGatewayInner> {
        // A poisoned lock only means a test panicked mid-write; the data is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn writes(&self) -> Vec<PortWrite> {
        self.lock().writes.clone()
    }

    pub fn writes_to(&self, port: u8) -> Vec<PortWrite> {
        self.lock().writes.iter().filter(|w| w.port == port).cloned().collect()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    pub fn port_state(&self, device_address: &str, port: u8) -> bool {
        self.lock()
            .ports
            .get(&(device_address.to_string(), port))
            .copied()
            .unwrap_or(false)
    }

    /// Change a port without recording a write, as if someone flipped it at the master.
    pub fn force_port(&self, device_address: &str, port: u8, state: bool) {
        self.lock().ports.insert((device_address.to_string(), port), state);
    }

    pub fn set_temperature(&self, device_id: &str, value: f64) {
        self.lock().temperatures.insert(device_id.to_string(), value);
    }

    /// Turn the write log on or off. Long simulator runs switch it off.
    pub fn record_writes(&self, record: bool) {
        let mut inner = self.lock();
        inner.unlogged = !record;
        if !record {
            inner.writes.clear();
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }
}

#[async_trait]
impl ActuatorGateway for MemoryGateway {
    async fn set_port(&self, device_address: &str, port: u8, state: bool) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(TransportError::Injected(format!("write to port {}", port)));
        }
        inner.ports.insert((device_address.to_string(), port), state);
        if !inner.unlogged {
            inner.writes.push(PortWrite {
                device_address: device_address.to_string(),
                port,
                state,
            });
        }
        Ok(())
    }

    async fn read_port(&self, device_address: &str, port: u8) -> Result<bool, TransportError> {
        let inner = self.lock();
        if inner.fail_reads {
            return Err(TransportError::Injected(format!("read of port {}", port)));
        }
        Ok(inner
            .ports
            .get(&(device_address.to_string(), port))
            .copied()
            .unwrap_or(false))
    }
}

#[async_trait]
impl TemperatureSource for MemoryGateway {
    async fn fetch_temperature(&self, device_id: &str) -> Result<f64, TransportError> {
        self.lock()
            .temperatures
            .get(device_id)
            .copied()
            .ok_or_else(|| TransportError::Injected(format!("no temperature for {}", device_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_gateway_records_writes() {
        let gateway = MemoryGateway::new();
        gateway.set_port("10.0.0.1", 2, true).await.unwrap();
        gateway.set_port("10.0.0.1", 5, false).await.unwrap();
        assert_eq!(gateway.writes().len(), 2);
        assert_eq!(gateway.writes_to(2)[0].state, true);
        assert!(gateway.read_port("10.0.0.1", 2).await.unwrap());
        assert!(!gateway.read_port("10.0.0.2", 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_unlogged_writes_still_apply() {
        let gateway = MemoryGateway::new();
        gateway.set_port("10.0.0.1", 5, true).await.unwrap();
        gateway.record_writes(false);
        assert!(gateway.writes().is_empty());
        for _ in 0..1000 {
            gateway.set_port("10.0.0.1", 5, true).await.unwrap();
            gateway.set_port("10.0.0.1", 5, false).await.unwrap();
        }
        assert!(gateway.writes().is_empty());
        assert!(!gateway.port_state("10.0.0.1", 5));

        gateway.record_writes(true);
        gateway.set_port("10.0.0.1", 1, true).await.unwrap();
        assert_eq!(gateway.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_gateway_failures() {
        let gateway = MemoryGateway::new();
        gateway.fail_reads(true);
        assert!(gateway.read_port("10.0.0.1", 1).await.is_err());
        gateway.fail_writes(true);
        assert!(gateway.set_port("10.0.0.1", 1, true).await.is_err());
        assert!(gateway.writes().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_set_port_is_fire_and_forget() {
        let gateway = Arc::new(MemoryGateway::new());
        let handle = spawn_set_port(gateway.clone(), "10.0.0.1".to_string(), ANALOG_PORT, true);
        handle.await.unwrap();
        assert!(gateway.port_state("10.0.0.1", ANALOG_PORT));
    }

    #[test]
    fn test_getdata_response_parsing() {
        let body: GetDataResponse =
            serde_json::from_str(r#"{"status":"ok","response":{"data":{"value":"01"}}}"#).unwrap();
        assert_eq!(body.status, "ok");
        assert_eq!(body.response.unwrap().data.unwrap().value, "01");
        let body: GetDataResponse = serde_json::from_str(r#"{"status":"error"}"#).unwrap();
        assert!(body.response.is_none());
    }

    #[test]
    fn test_setdata_request_shape() {
        let json = serde_json::to_value(SetDataRequest {
            state: true,
            device_address: "192.168.30.29",
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"state": true, "deviceAddress": "192.168.30.29"}));
    }
}
