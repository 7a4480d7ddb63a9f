// src/controller/instance.rs - State-owning task of one controller instance
use super::command::ControllerCommand;
use super::io;
use super::{ControlError, InstanceDeps, InstanceSettings};
use crate::control::cascade::{MAX_TIMER_SIZE, MIN_TIMER_SIZE};
use crate::control::{
    CascadeSectionManager, Gains, HeaterSnapshot, HeaterState, OutputCalculator, PulseChannel, Reconciliation,
    TemperatureTrendTracker, SECTION_COUNT,
};
use crate::gateway::{section_port, spawn_set_port};
use crate::setpoint::{SetpointChange, SetpointSubscription};
use crate::store::PersistedHeaterState;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use uuid::Uuid;

pub(crate) struct HeaterController {
    pub(crate) settings: InstanceSettings,
    pub(crate) deps: InstanceDeps,
    pub(crate) state: HeaterState,
    pub(crate) tracker: TemperatureTrendTracker,
    pub(crate) calculator: OutputCalculator,
    pub(crate) cascade: CascadeSectionManager,
    pub(crate) pulse: PulseChannel,
    /// Analog channel already switched off while control is gated.
    pub(crate) analog_parked: bool,
    pub(crate) origin: Uuid,
    /// Sequence number of the newest shared setpoint write applied here.
    pub(crate) setpoint_seq: u64,
    pub(crate) commands: mpsc::Sender<ControllerCommand>,
    pub(crate) snapshots: watch::Sender<HeaterSnapshot>,
    pub(crate) shutdown: broadcast::Sender<()>,
    pub(crate) last_saved: Option<PersistedHeaterState>,
}

impl HeaterController {
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<ControllerCommand>, mut setpoints: SetpointSubscription) {
        let mut control = interval(self.settings.control_period);
        control.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut display = interval(self.settings.snapshot_period);
        display.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!("{} controller started", self.settings.name);
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(ControllerCommand::Shutdown { respond_to }) => {
                        self.stop().await;
                        let _ = respond_to.send(());
                        return;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.stop().await;
                        return;
                    }
                },
                _ = control.tick() => self.control_tick(Instant::now()),
                Some(change) = setpoints.recv() => self.absorb_shared_setpoint(change),
                _ = display.tick() => {
                    self.publish_snapshot();
                    continue;
                }
            }
            self.persist_if_changed().await;
            self.publish_snapshot();
        }
    }

    async fn handle(&mut self, command: ControllerCommand) {
        let now = Instant::now();
        match command {
            ControllerCommand::Temperature(value) => {
                if self.state.apply_temperature(value, now) {
                    self.tracker.record(value, now);
                } else {
                    tracing::debug!("{} ignoring non-positive temperature {}", self.settings.name, value);
                }
            }
            ControllerCommand::Reconcile { readings } => self.reconcile(readings, now),
            ControllerCommand::SetSetpoint { value, respond_to } => {
                let _ = respond_to.send(self.set_setpoint(value, now).await);
            }
            ControllerCommand::ToggleAuto { respond_to } => {
                let _ = respond_to.send(self.toggle_auto());
            }
            ControllerCommand::ToggleSection { index, respond_to } => {
                let _ = respond_to.send(self.toggle_section(index, now));
            }
            ControllerCommand::SetGains { gains, respond_to } => {
                let _ = respond_to.send(self.set_gains(gains));
            }
            ControllerCommand::SetTimerSize { timer_size, respond_to } => {
                let _ = respond_to.send(self.set_timer_size(timer_size));
            }
            ControllerCommand::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot(now));
            }
            // Handled by the run loop
            ControllerCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    /// One 1 Hz control step.
    pub(crate) fn control_tick(&mut self, now: Instant) {
        if !self.state.has_reading() || !self.state.sections.is_on(0) {
            self.state.output = 0.0;
            self.cascade.reset();
            if !self.analog_parked {
                self.pulse.drive(0.0);
                self.analog_parked = true;
            }
            return;
        }

        let velocity = self.tracker.velocity(now);
        let (output, mode) = self.calculator.compute(
            self.state.setpoint,
            self.state.current_temp,
            self.state.output,
            &self.state.gains,
            velocity,
        );
        if mode != self.state.control_mode {
            tracing::info!(
                "{} switching to {} (error {:.1}°F)",
                self.settings.name,
                mode,
                self.state.setpoint - self.state.current_temp
            );
        }
        self.state.output = output;
        self.state.control_mode = mode;
        self.pulse.drive(output);
        self.analog_parked = output <= 0.0;

        if self.state.is_auto {
            if let Some(change) = self.cascade.evaluate(output, &self.state.sections.commanded(), now) {
                tracing::info!(
                    "{} cascade {:?}: section {} -> {}",
                    self.settings.name,
                    change,
                    change.index() + 1,
                    if change.energize() { "ON" } else { "OFF" }
                );
                self.command_section(change.index(), change.energize(), now);
            }
        }
        tracing::debug!(
            "{} tick: {:.1}°F -> {:.1}°F, output {:.0}% ({}), velocity {:.3}°F/s",
            self.settings.name,
            self.state.current_temp,
            self.state.setpoint,
            output,
            mode,
            velocity
        );
    }

    fn command_section(&mut self, index: usize, on: bool, now: Instant) {
        self.state.sections.command(index, on, now);
        self.state.last_section_change = now;
        spawn_set_port(
            self.deps.gateway.clone(),
            self.settings.device_address.clone(),
            section_port(index),
            on,
        );
    }

    fn reconcile(&mut self, readings: [Option<bool>; SECTION_COUNT], now: Instant) {
        for (index, reading) in readings.into_iter().enumerate() {
            let Some(actual) = reading else {
                continue;
            };
            let hold = self.state.is_auto && index == 0;
            match self
                .state
                .sections
                .reconcile(index, actual, hold, self.settings.confirm_grace, now)
            {
                Reconciliation::InSync => {}
                Reconciliation::Adopted { index, actual } => {
                    tracing::info!(
                        "{} section {} synced from actuator: {}",
                        self.settings.name,
                        index + 1,
                        if actual { "ON" } else { "OFF" }
                    );
                    self.state.last_section_change = now;
                }
                Reconciliation::Reasserted { index, commanded } => {
                    tracing::info!(
                        "{} section {} held {} in auto mode, re-commanding",
                        self.settings.name,
                        index + 1,
                        if commanded { "ON" } else { "OFF" }
                    );
                    spawn_set_port(
                        self.deps.gateway.clone(),
                        self.settings.device_address.clone(),
                        section_port(index),
                        commanded,
                    );
                }
                Reconciliation::AwaitingConfirmation { index } => {
                    tracing::debug!("{} section {} awaiting confirmation", self.settings.name, index + 1);
                }
            }
        }
    }

    async fn set_setpoint(&mut self, value: f64, now: Instant) -> Result<f64, ControlError> {
        if !value.is_finite() {
            return Err(ControlError::InvalidSetpoint(value));
        }
        let value = value.clamp(0.0, self.settings.max_temp);
        self.state.apply_setpoint(value);
        tracing::info!("{} setpoint set to {:.1}°F", self.settings.name, value);
        if self.state.has_reading() && value > self.state.current_temp && !self.state.sections.is_on(0) {
            tracing::info!("{} switching section 1 on for new setpoint", self.settings.name);
            self.command_section(0, true, now);
        }
        let seq = self.deps.sync.set(self.origin, value).await;
        self.setpoint_seq = self.setpoint_seq.max(seq);
        Ok(value)
    }

    fn absorb_shared_setpoint(&mut self, change: SetpointChange) {
        if change.seq <= self.setpoint_seq {
            tracing::debug!(
                "{} ignoring superseded setpoint {:.1}°F (write {} <= {})",
                self.settings.name,
                change.value,
                change.seq,
                self.setpoint_seq
            );
            return;
        }
        self.setpoint_seq = change.seq;
        let value = change.value.clamp(0.0, self.settings.max_temp);
        self.state.apply_setpoint(value);
        tracing::info!(
            "{} setpoint synchronized to {:.1}°F (was {:.1}°F)",
            self.settings.name,
            value,
            self.state.previous_setpoint
        );
    }

    fn toggle_auto(&mut self) -> bool {
        self.state.is_auto = !self.state.is_auto;
        self.cascade.reset();
        tracing::info!(
            "{} {} automatic cascade with {}/{} sections active",
            self.settings.name,
            if self.state.is_auto { "entered" } else { "left" },
            self.state.sections.active(),
            SECTION_COUNT
        );
        self.state.is_auto
    }

    fn toggle_section(&mut self, index: usize, now: Instant) -> Result<bool, ControlError> {
        if index >= SECTION_COUNT {
            return Err(ControlError::InvalidSection(index));
        }
        let exempt = index == 0 && self.settings.allow_primary_toggle_in_auto;
        if self.state.is_auto && !exempt {
            return Err(ControlError::AutoModeLocked { section: index });
        }
        let on = !self.state.sections.is_on(index);
        tracing::info!(
            "{} section {} switched {} by operator",
            self.settings.name,
            index + 1,
            if on { "ON" } else { "OFF" }
        );
        self.command_section(index, on, now);
        io::spawn_early_poll(
            self.deps.gateway.clone(),
            self.settings.device_address.clone(),
            self.settings.early_poll_delay,
            self.commands.clone(),
        );
        Ok(on)
    }

    fn set_gains(&mut self, gains: Gains) -> Result<Gains, ControlError> {
        for (name, value) in [("kp", gains.kp), ("ki", gains.ki), ("kd", gains.kd)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ControlError::InvalidGains(format!("{} must be a non-negative number, got {}", name, value)));
            }
        }
        self.state.gains = gains;
        tracing::info!(
            "{} gains set to kp={} ki={} kd={}",
            self.settings.name,
            gains.kp,
            gains.ki,
            gains.kd
        );
        Ok(gains)
    }

    fn set_timer_size(&mut self, timer_size: Duration) -> Result<Duration, ControlError> {
        if timer_size < MIN_TIMER_SIZE || timer_size > MAX_TIMER_SIZE {
            return Err(ControlError::TimerOutOfRange(timer_size.as_millis() as u64));
        }
        self.cascade.set_timer_size(timer_size);
        self.state.timer_size = self.cascade.timer_size();
        tracing::info!("{} cascade timer set to {} ms", self.settings.name, timer_size.as_millis());
        Ok(self.state.timer_size)
    }

    pub(crate) fn snapshot(&self, now: Instant) -> HeaterSnapshot {
        HeaterSnapshot {
            name: self.settings.name.clone(),
            setpoint: self.state.setpoint,
            previous_setpoint: self.state.previous_setpoint,
            current_temp: self.state.current_temp,
            output: self.state.output,
            gains: self.state.gains,
            control_mode: self.state.control_mode,
            sections: self.state.sections.commanded(),
            confirmed_sections: self.state.sections.confirmed(),
            is_auto: self.state.is_auto,
            temp_trend: self.state.temp_trend,
            velocity: self.tracker.velocity(now),
            pid: self.calculator.pid(),
            pulse_on_ms: self.pulse.last_schedule().map(|p| p.on_ms),
            countdown: self.cascade.countdown(now),
            max_temp: self.settings.max_temp,
            ms_since_temp_update: self
                .state
                .last_temp_update
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            ms_since_section_change: now.saturating_duration_since(self.state.last_section_change).as_millis() as u64,
        }
    }

    pub(crate) fn publish_snapshot(&self) {
        self.snapshots.send_replace(self.snapshot(Instant::now()));
    }

    pub(crate) fn persisted(&self) -> PersistedHeaterState {
        PersistedHeaterState {
            is_auto: self.state.is_auto,
            setpoint: self.state.setpoint,
            sections: self.state.sections.commanded(),
            kp: self.state.gains.kp,
            ki: self.state.gains.ki,
            kd: self.state.gains.kd,
            control_mode: self.state.control_mode,
            timer_size: self.state.timer_size.as_millis() as u64,
            saved_at: Utc::now(),
        }
    }

    async fn persist_if_changed(&mut self) {
        let record = self.persisted();
        if self.last_saved.as_ref().is_some_and(|saved| saved.same_settings(&record)) {
            return;
        }
        match self.deps.store.save_heater(&self.settings.name, &record).await {
            Ok(()) => {
                tracing::debug!("{} state saved", self.settings.name);
                self.last_saved = Some(record);
            }
            Err(e) => tracing::error!("Failed to save {} state: {}", self.settings.name, e),
        }
    }

    async fn stop(&mut self) {
        tracing::info!("{} controller shutting down", self.settings.name);
        let _ = self.shutdown.send(());
        self.persist_if_changed().await;
        self.pulse.shutdown().await;
        self.publish_snapshot();
    }
}
