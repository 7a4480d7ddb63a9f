// src/control/pulse.rs - Pulse-width modulation of the analog heater channel
use crate::gateway::{spawn_set_port, ActuatorGateway, ANALOG_PORT};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

pub const DEFAULT_PERIOD_MS: u64 = 1000;
pub const DEFAULT_MIN_PULSE_MS: u64 = 50;

/// On/off split of one modulation period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseSchedule {
    pub on_ms: u64,
    pub off_ms: u64,
}

/// Convert an output percentage into on/off times.
///
/// Any non-zero output gets at least `min_pulse_ms` of on time. The on time
/// never exceeds the period.
pub fn schedule(output: f64, period_ms: u64, min_pulse_ms: u64) -> PulseSchedule {
    let proportional = (output.clamp(0.0, 100.0) / 100.0 * period_ms as f64).round() as u64;
    let on_ms = proportional.max(min_pulse_ms).min(period_ms);
    PulseSchedule {
        on_ms,
        off_ms: period_ms - on_ms,
    }
}

/// Drives one analog channel with at most one pending OFF transition.
pub struct PulseChannel {
    gateway: Arc<dyn ActuatorGateway>,
    device_address: String,
    port: u8,
    period_ms: u64,
    min_pulse_ms: u64,
    pending_off: Option<JoinHandle<()>>,
    last_schedule: Option<PulseSchedule>,
}

impl PulseChannel {
    pub fn new(gateway: Arc<dyn ActuatorGateway>, device_address: &str, period_ms: u64, min_pulse_ms: u64) -> Self {
        Self {
            gateway,
            device_address: device_address.to_string(),
            port: ANALOG_PORT,
            period_ms,
            min_pulse_ms,
            pending_off: None,
            last_schedule: None,
        }
    }

    fn cancel_pending(&mut self) {
        if let Some(handle) = self.pending_off.take() {
            handle.abort();
        }
    }

    /// Start a new modulation period for `output`.
    ///
    /// Cancels whatever OFF was still pending from the previous period. With
    /// zero output only an OFF is sent; at 100% duty the channel is left ON and
    /// no OFF is scheduled.
    pub fn drive(&mut self, output: f64) -> Option<PulseSchedule> {
        self.cancel_pending();
        if output <= 0.0 {
            self.last_schedule = None;
            spawn_set_port(self.gateway.clone(), self.device_address.clone(), self.port, false);
            return None;
        }

        let pulse = schedule(output, self.period_ms, self.min_pulse_ms);
        spawn_set_port(self.gateway.clone(), self.device_address.clone(), self.port, true);
        if pulse.off_ms > 0 {
            let gateway = self.gateway.clone();
            let address = self.device_address.clone();
            let port = self.port;
            let on_time = Duration::from_millis(pulse.on_ms);
            self.pending_off = Some(tokio::spawn(async move {
                sleep(on_time).await;
                if let Err(e) = gateway.set_port(&address, port, false).await {
                    tracing::warn!("Pulse OFF on port {} of {} failed: {}", port, address, e);
                }
            }));
        }
        self.last_schedule = Some(pulse);
        Some(pulse)
    }

    pub fn has_pending_off(&self) -> bool {
        self.pending_off.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn last_schedule(&self) -> Option<PulseSchedule> {
        self.last_schedule
    }

    /// Cancel the pending OFF and wait (bounded) for a final OFF command.
    pub async fn shutdown(&mut self) {
        self.cancel_pending();
        self.last_schedule = None;
        match timeout(Duration::from_secs(2), self.gateway.set_port(&self.device_address, self.port, false)).await {
            Ok(Ok(())) => tracing::info!("Analog channel on {} switched off", self.device_address),
            Ok(Err(e)) => tracing::error!("Final OFF for {} failed: {}", self.device_address, e),
            Err(_) => tracing::error!("Final OFF for {} timed out", self.device_address),
        }
    }
}

impl Drop for PulseChannel {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}
