//! # Host Configuration
//!
//! One TOML file describes the gateway, the telemetry feed, where state is
//! persisted and every heater under control.
//!
//! ```toml
//! [control]
//! max_temp = 750.0
//! timer_size_ms = 15000
//!
//! [gateway]
//! base_url = "http://192.168.30.10:3001"
//!
//! [telemetry]
//! feed_addr = "192.168.30.10:1883"
//!
//! [[heaters]]
//! name = "HTR-A"
//! device_address = "192.168.30.29"
//! device_id = "00-02-01-6D-55-8A"
//!
//! [[heaters]]
//! name = "HTR-B"
//! device_address = "192.168.30.33"
//! ```

// src/config.rs - Single configuration file
use crate::control::cascade::{MAX_TIMER_SIZE, MIN_TIMER_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tokio::time::Duration;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub heaters: Vec<HeaterConfig>,
}

/// Defaults shared by every controller instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    #[serde(default = "default_max_temp")]
    pub max_temp: f64,
    #[serde(default = "default_timer_size_ms")]
    pub timer_size_ms: u64,
    #[serde(default = "default_pulse_period_ms")]
    pub pulse_period_ms: u64,
    #[serde(default = "default_min_pulse_ms")]
    pub min_pulse_ms: u64,
    /// How long a freshly commanded section may disagree with its read-back.
    #[serde(default = "default_confirm_grace_ms")]
    pub confirm_grace_ms: u64,
    /// Delay before restored sections are re-sent to the actuator.
    #[serde(default = "default_restore_delay_ms")]
    pub restore_delay_ms: u64,
    #[serde(default)]
    pub allow_primary_toggle_in_auto: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_temp: default_max_temp(),
            timer_size_ms: default_timer_size_ms(),
            pulse_period_ms: default_pulse_period_ms(),
            min_pulse_ms: default_min_pulse_ms(),
            confirm_grace_ms: default_confirm_grace_ms(),
            restore_delay_ms: default_restore_delay_ms(),
            allow_primary_toggle_in_auto: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_url(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// `host:port` of the line-delimited JSON feed. No push feed when unset.
    #[serde(default)]
    pub feed_addr: Option<String>,
    /// Base URL for the polling fallback; the gateway URL when unset.
    #[serde(default)]
    pub poll_base_url: Option<String>,
    #[serde(default = "default_true")]
    pub poll_enabled: bool,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            feed_addr: None,
            poll_base_url: None,
            poll_enabled: true,
            stale_after_secs: default_stale_after_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_dir")]
    pub dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { dir: default_store_dir() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

/// One heater under control.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaterConfig {
    pub name: String,
    /// IO-Link master address used for port writes and read-backs.
    pub device_address: String,
    /// Identifier for the polling fallback; the name when unset.
    #[serde(default)]
    pub device_id: Option<String>,
    /// Device key used to route feed messages; the name when unset.
    #[serde(default)]
    pub telemetry_device: Option<String>,
    #[serde(default)]
    pub max_temp: Option<f64>,
    #[serde(default)]
    pub timer_size_ms: Option<u64>,
}

impl HeaterConfig {
    pub fn device_id(&self) -> &str {
        self.device_id.as_deref().unwrap_or(&self.name)
    }

    pub fn telemetry_device(&self) -> &str {
        self.telemetry_device.as_deref().unwrap_or(&self.name)
    }

    pub fn max_temp(&self, control: &ControlConfig) -> f64 {
        self.max_temp.unwrap_or(control.max_temp)
    }

    pub fn timer_size(&self, control: &ControlConfig) -> Duration {
        Duration::from_millis(self.timer_size_ms.unwrap_or(control.timer_size_ms))
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let control = &self.control;
        if control.max_temp <= 0.0 {
            return invalid(format!("control.max_temp must be > 0, got {}", control.max_temp));
        }
        if control.pulse_period_ms == 0 {
            return invalid("control.pulse_period_ms must be > 0".to_string());
        }
        if control.min_pulse_ms > control.pulse_period_ms {
            return invalid(format!(
                "control.min_pulse_ms ({}) exceeds pulse_period_ms ({})",
                control.min_pulse_ms, control.pulse_period_ms
            ));
        }
        check_timer_size("control.timer_size_ms", control.timer_size_ms)?;

        let mut names = HashSet::new();
        for heater in &self.heaters {
            if heater.name.trim().is_empty() {
                return invalid("heater name must not be empty".to_string());
            }
            if !names.insert(heater.name.to_ascii_lowercase()) {
                return invalid(format!("duplicate heater '{}'", heater.name));
            }
            if heater.device_address.trim().is_empty() {
                return invalid(format!("heater '{}' has no device_address", heater.name));
            }
            if let Some(max_temp) = heater.max_temp {
                if max_temp <= 0.0 {
                    return invalid(format!("heater '{}' max_temp must be > 0", heater.name));
                }
            }
            if let Some(ms) = heater.timer_size_ms {
                check_timer_size(&format!("heaters.{}.timer_size_ms", heater.name), ms)?;
            }
        }
        Ok(())
    }

    /// Device keys the telemetry hub should recognize in topics.
    pub fn telemetry_devices(&self) -> Vec<String> {
        self.heaters.iter().map(|h| h.telemetry_device().to_string()).collect()
    }
}

fn check_timer_size(field: &str, ms: u64) -> Result<(), ConfigError> {
    let range = MIN_TIMER_SIZE.as_millis() as u64..=MAX_TIMER_SIZE.as_millis() as u64;
    if !range.contains(&ms) {
        return Err(ConfigError::Invalid(format!(
            "{} must be within {}..={} ms, got {}",
            field,
            range.start(),
            range.end(),
            ms
        )));
    }
    Ok(())
}

// Default value functions
fn default_max_temp() -> f64 { 750.0 }
fn default_timer_size_ms() -> u64 { 15_000 }
fn default_pulse_period_ms() -> u64 { 1000 }
fn default_min_pulse_ms() -> u64 { 50 }
fn default_confirm_grace_ms() -> u64 { 1500 }
fn default_restore_delay_ms() -> u64 { 2000 }
fn default_gateway_url() -> String { "http://127.0.0.1:3001".to_string() }
fn default_request_timeout_ms() -> u64 { 2000 }
fn default_true() -> bool { true }
fn default_stale_after_secs() -> u64 { 30 }
fn default_max_reconnect_attempts() -> u32 { 10 }
fn default_store_dir() -> String { "state".to_string() }
fn default_bind() -> String { "0.0.0.0:3000".to_string() }

/// Loads and validates the configuration from a TOML file.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!("Rejected config '{}': {}", path, e);
        return Err(e);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_config(contents: &str) -> (tempfile::TempDir, String) {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("test_config.toml");
        let mut file = File::create(&file_path).unwrap();
        write!(file, "{}", contents).unwrap();
        file.flush().unwrap();
        let path = file_path.to_str().unwrap().to_string();
        (dir, path)
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.control.max_temp, 750.0);
        assert_eq!(config.control.timer_size_ms, 15_000);
        assert_eq!(config.control.pulse_period_ms, 1000);
        assert_eq!(config.control.min_pulse_ms, 50);
        assert_eq!(config.control.confirm_grace_ms, 1500);
        assert!(!config.control.allow_primary_toggle_in_auto);
        assert_eq!(config.telemetry.stale_after_secs, 30);
        assert_eq!(config.telemetry.max_reconnect_attempts, 10);
        assert_eq!(config.web.bind, "0.0.0.0:3000");
        assert!(config.heaters.is_empty());
    }

    #[test]
    fn test_load_config_success() {
        let (_dir, path) = write_config(
            "[control]\nmax_temp = 500.0\n\n[[heaters]]\nname = 'HTR-A'\ndevice_address = '192.168.30.29'\ndevice_id = '00-02-01-6D-55-8A'\n\n[[heaters]]\nname = 'HTR-B'\ndevice_address = '192.168.30.33'\ntimer_size_ms = 30000\n",
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.control.max_temp, 500.0);
        // Defaults for missing fields
        assert_eq!(config.control.timer_size_ms, 15_000);
        assert_eq!(config.heaters.len(), 2);
        assert_eq!(config.heaters[0].device_id(), "00-02-01-6D-55-8A");
        assert_eq!(config.heaters[1].device_id(), "HTR-B");
        assert_eq!(config.heaters[1].timer_size(&config.control), Duration::from_secs(30));
        assert_eq!(config.heaters[0].max_temp(&config.control), 500.0);
        assert_eq!(config.telemetry_devices(), vec!["HTR-A", "HTR-B"]);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config("/nonexistent/path/to/config.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let (_dir, path) = write_config("[control\nmax_temp = 'hot'");
        assert!(matches!(load_config(&path), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let (_dir, path) = write_config("[control]\ntimer_size_ms = 1000\n");
        assert!(matches!(load_config(&path), Err(ConfigError::Invalid(_))));

        let (_dir, path) = write_config(
            "[[heaters]]\nname = 'HTR-A'\ndevice_address = 'a'\n\n[[heaters]]\nname = 'htr-a'\ndevice_address = 'b'\n",
        );
        assert!(matches!(load_config(&path), Err(ConfigError::Invalid(_))));

        let (_dir, path) = write_config("[control]\nmin_pulse_ms = 2000\n");
        assert!(matches!(load_config(&path), Err(ConfigError::Invalid(_))));
    }
}
