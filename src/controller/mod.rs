//! Per-heater controller instances.
//!
//! Each instance is one task owning its [`HeaterState`]. Operators and I/O
//! tasks talk to it through a [`ControllerHandle`], which queues
//! [`ControllerCommand`]s; observers read snapshots from a watch channel.

pub mod command;
mod instance;
mod io;

pub use command::ControllerCommand;

use crate::config::{ControlConfig, HeaterConfig};
use crate::control::cascade::DEFAULT_TIMER_SIZE;
use crate::control::pulse::{DEFAULT_MIN_PULSE_MS, DEFAULT_PERIOD_MS};
use crate::control::{
    CascadeSectionManager, GainPreset, Gains, HeaterSnapshot, HeaterState, OutputCalculator, PulseChannel,
    SectionBank, TemperatureTrendTracker,
};
use crate::gateway::{ActuatorGateway, TemperatureSource};
use crate::setpoint::SetpointSynchronizer;
use crate::store::{load_fresh, StateStore};
use crate::telemetry::TelemetryHub;
use instance::HeaterController;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Duration, Instant};

/// Operator action rejected by a controller instance.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error("Section {} cannot be toggled while auto mode is active", .section + 1)]
    AutoModeLocked { section: usize },
    #[error("Section index {0} does not exist")]
    InvalidSection(usize),
    #[error("Timer size {0} ms is outside 5000..=120000 ms")]
    TimerOutOfRange(u64),
    #[error("Setpoint {0} is not a number")]
    InvalidSetpoint(f64),
    #[error("Invalid gains: {0}")]
    InvalidGains(String),
    #[error("Controller instance has stopped")]
    InstanceStopped,
}

/// Collaborators shared between instances, built by the composition root.
#[derive(Clone)]
pub struct InstanceDeps {
    pub gateway: Arc<dyn ActuatorGateway>,
    /// Polling fallback for temperatures; push-only when `None`.
    pub poller: Option<Arc<dyn TemperatureSource>>,
    pub hub: Arc<TelemetryHub>,
    pub store: Arc<dyn StateStore>,
    pub sync: Arc<SetpointSynchronizer>,
}

#[derive(Debug, Clone)]
pub struct InstanceSettings {
    pub name: String,
    pub device_address: String,
    pub device_id: String,
    pub telemetry_device: String,
    pub max_temp: f64,
    pub timer_size: Duration,
    pub pulse_period_ms: u64,
    pub min_pulse_ms: u64,
    pub confirm_grace: Duration,
    pub restore_delay: Duration,
    pub early_poll_delay: Duration,
    pub allow_primary_toggle_in_auto: bool,
    pub control_period: Duration,
    pub poll_period: Duration,
    pub snapshot_period: Duration,
}

impl InstanceSettings {
    pub fn new(name: &str, device_address: &str) -> Self {
        Self {
            name: name.to_string(),
            device_address: device_address.to_string(),
            device_id: name.to_string(),
            telemetry_device: name.to_string(),
            max_temp: 750.0,
            timer_size: DEFAULT_TIMER_SIZE,
            pulse_period_ms: DEFAULT_PERIOD_MS,
            min_pulse_ms: DEFAULT_MIN_PULSE_MS,
            confirm_grace: Duration::from_millis(1500),
            restore_delay: Duration::from_millis(2000),
            early_poll_delay: Duration::from_millis(500),
            allow_primary_toggle_in_auto: false,
            control_period: Duration::from_secs(1),
            poll_period: Duration::from_secs(1),
            snapshot_period: Duration::from_millis(100),
        }
    }

    pub fn from_config(heater: &HeaterConfig, control: &ControlConfig) -> Self {
        Self {
            device_id: heater.device_id().to_string(),
            telemetry_device: heater.telemetry_device().to_string(),
            max_temp: heater.max_temp(control),
            timer_size: heater.timer_size(control),
            pulse_period_ms: control.pulse_period_ms,
            min_pulse_ms: control.min_pulse_ms,
            confirm_grace: Duration::from_millis(control.confirm_grace_ms),
            restore_delay: Duration::from_millis(control.restore_delay_ms),
            allow_primary_toggle_in_auto: control.allow_primary_toggle_in_auto,
            ..Self::new(&heater.name, &heater.device_address)
        }
    }
}

/// Cheap, cloneable front end of one controller instance.
#[derive(Clone)]
pub struct ControllerHandle {
    name: String,
    commands: mpsc::Sender<ControllerCommand>,
    snapshots: watch::Receiver<HeaterSnapshot>,
}

impl ControllerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ControllerCommand) -> Result<T, ControlError> {
        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(make(respond_to))
            .await
            .map_err(|_| ControlError::InstanceStopped)?;
        response.await.map_err(|_| ControlError::InstanceStopped)
    }

    /// Returns the clamped value actually applied.
    pub async fn set_setpoint(&self, value: f64) -> Result<f64, ControlError> {
        self.request(|respond_to| ControllerCommand::SetSetpoint { value, respond_to })
            .await?
    }

    pub async fn toggle_auto(&self) -> Result<bool, ControlError> {
        self.request(|respond_to| ControllerCommand::ToggleAuto { respond_to }).await
    }

    /// Toggle a section by zero-based index.
    pub async fn toggle_section(&self, index: usize) -> Result<bool, ControlError> {
        self.request(|respond_to| ControllerCommand::ToggleSection { index, respond_to })
            .await?
    }

    pub async fn set_gains(&self, gains: Gains) -> Result<Gains, ControlError> {
        self.request(|respond_to| ControllerCommand::SetGains { gains, respond_to })
            .await?
    }

    pub async fn apply_preset(&self, preset: GainPreset) -> Result<Gains, ControlError> {
        self.set_gains(preset.gains()).await
    }

    pub async fn set_timer_size(&self, timer_size: Duration) -> Result<Duration, ControlError> {
        self.request(|respond_to| ControllerCommand::SetTimerSize { timer_size, respond_to })
            .await?
    }

    /// Fresh projection straight from the state task.
    pub async fn snapshot(&self) -> Result<HeaterSnapshot, ControlError> {
        self.request(|respond_to| ControllerCommand::GetSnapshot { respond_to }).await
    }

    /// Last published projection, refreshed at 10 Hz.
    pub fn latest_snapshot(&self) -> HeaterSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<HeaterSnapshot> {
        self.snapshots.clone()
    }

    /// Stop the instance and wait for the final analog OFF.
    pub async fn shutdown(&self) {
        if self.request(|respond_to| ControllerCommand::Shutdown { respond_to }).await.is_err() {
            tracing::debug!("{} was already stopped", self.name);
        }
    }
}

/// Build the instance state (restoring it when a fresh record exists) and
/// start its tasks.
pub async fn spawn(settings: InstanceSettings, deps: InstanceDeps) -> ControllerHandle {
    let now = Instant::now();
    // Subscribe before reading so no write lands between the two
    let setpoints = deps.sync.subscribe();
    let shared = deps.sync.current().await.min(settings.max_temp);
    let mut state = HeaterState::new(shared, now);
    let mut cascade = CascadeSectionManager::new(settings.timer_size);

    let restored = load_fresh(deps.store.as_ref(), &settings.name).await;
    if let Some(record) = &restored {
        state.is_auto = record.is_auto;
        state.sections = SectionBank::new(record.sections);
        // Restored sections count as commanded when they are re-sent, so
        // read-backs before then do not undo them
        let resend_at = now + settings.restore_delay;
        for (index, on) in record.sections.iter().enumerate() {
            if *on {
                state.sections.command(index, true, resend_at);
            }
        }
        state.gains = Gains {
            kp: record.kp,
            ki: record.ki,
            kd: record.kd,
        };
        state.control_mode = record.control_mode;
        cascade.set_timer_size(Duration::from_millis(record.timer_size));
    }
    state.timer_size = cascade.timer_size();

    let (commands, rx) = mpsc::channel(64);
    let (shutdown, _) = broadcast::channel(1);
    let pulse = PulseChannel::new(
        deps.gateway.clone(),
        &settings.device_address,
        settings.pulse_period_ms,
        settings.min_pulse_ms,
    );

    if let Some(record) = &restored {
        if record.sections.iter().any(|on| *on) {
            io::spawn_restore(
                deps.gateway.clone(),
                settings.device_address.clone(),
                record.sections,
                settings.restore_delay,
                shutdown.subscribe(),
            );
        }
    }
    io::spawn_push(
        deps.hub.subscribe(&settings.telemetry_device),
        commands.clone(),
        shutdown.subscribe(),
    );
    if let Some(poller) = &deps.poller {
        io::spawn_poll(
            poller.clone(),
            settings.device_id.clone(),
            settings.poll_period,
            commands.clone(),
            shutdown.subscribe(),
        );
    }
    io::spawn_actuator_poll(
        deps.gateway.clone(),
        settings.device_address.clone(),
        settings.poll_period,
        commands.clone(),
        shutdown.subscribe(),
    );

    let controller = HeaterController {
        settings,
        deps,
        state,
        tracker: TemperatureTrendTracker::new(),
        calculator: OutputCalculator::new(),
        cascade,
        pulse,
        analog_parked: false,
        origin: setpoints.id(),
        setpoint_seq: 0,
        commands: commands.clone(),
        snapshots: watch::Sender::new(HeaterSnapshot::default()),
        shutdown,
        last_saved: restored,
    };
    controller.publish_snapshot();
    let snapshot_rx = controller.snapshots.subscribe();

    let handle = ControllerHandle {
        name: controller.settings.name.clone(),
        commands,
        snapshots: snapshot_rx,
    };
    tokio::spawn(controller.run(rx, setpoints));
    handle
}
