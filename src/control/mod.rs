// src/control/mod.rs - Heater state and the control algorithms acting on it
pub mod cascade;
pub mod output;
pub mod pulse;
pub mod trend;

pub use cascade::{CascadeSectionManager, Countdown, NextAction, SectionChange, SECTION_COUNT};
pub use output::{ControlMode, GainPreset, Gains, OutputCalculator, PidTerm};
pub use pulse::{PulseChannel, PulseSchedule};
pub use trend::{TempTrend, TemperatureTrendTracker};

use serde::Serialize;
use tokio::time::{Duration, Instant};

/// Section states split into operator/algorithm intent and actuator read-back.
#[derive(Debug, Clone)]
pub struct SectionBank {
    commanded: [bool; SECTION_COUNT],
    confirmed: [Option<bool>; SECTION_COUNT],
    commanded_at: [Option<Instant>; SECTION_COUNT],
}

/// Outcome of comparing one read-back against the commanded state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    InSync,
    /// Actuator disagreed; its value was adopted.
    Adopted { index: usize, actual: bool },
    /// Actuator disagreed but the section must keep its commanded value.
    Reasserted { index: usize, commanded: bool },
    /// Commanded recently; the actuator may not have applied it yet.
    AwaitingConfirmation { index: usize },
}

impl SectionBank {
    pub fn new(initial: [bool; SECTION_COUNT]) -> Self {
        Self {
            commanded: initial,
            confirmed: [None; SECTION_COUNT],
            commanded_at: [None; SECTION_COUNT],
        }
    }

    pub fn commanded(&self) -> [bool; SECTION_COUNT] {
        self.commanded
    }

    pub fn confirmed(&self) -> [Option<bool>; SECTION_COUNT] {
        self.confirmed
    }

    pub fn is_on(&self, index: usize) -> bool {
        self.commanded[index]
    }

    pub fn active(&self) -> usize {
        cascade::active_sections(&self.commanded)
    }

    pub fn command(&mut self, index: usize, state: bool, now: Instant) {
        self.commanded[index] = state;
        self.commanded_at[index] = Some(now);
    }

    /// Fold one actuator read-back into the bank.
    ///
    /// `hold_commanded` keeps the commanded value no matter what the actuator
    /// says. Sections commanded within `grace` are left alone until the
    /// actuator has had a chance to apply them.
    pub fn reconcile(
        &mut self,
        index: usize,
        actual: bool,
        hold_commanded: bool,
        grace: Duration,
        now: Instant,
    ) -> Reconciliation {
        self.confirmed[index] = Some(actual);
        if self.commanded[index] == actual {
            return Reconciliation::InSync;
        }
        if hold_commanded {
            return Reconciliation::Reasserted {
                index,
                commanded: self.commanded[index],
            };
        }
        if let Some(at) = self.commanded_at[index] {
            if now.saturating_duration_since(at) < grace {
                return Reconciliation::AwaitingConfirmation { index };
            }
        }
        self.commanded[index] = actual;
        self.commanded_at[index] = None;
        Reconciliation::Adopted { index, actual }
    }
}

/// Everything a controller instance knows about its heater.
#[derive(Debug, Clone)]
pub struct HeaterState {
    pub setpoint: f64,
    pub previous_setpoint: f64,
    pub pending_change: bool,
    pub current_temp: f64,
    pub last_temp: f64,
    pub output: f64,
    pub gains: Gains,
    pub control_mode: ControlMode,
    pub sections: SectionBank,
    pub is_auto: bool,
    pub temp_trend: TempTrend,
    pub last_temp_update: Option<Instant>,
    pub last_section_change: Instant,
    pub timer_size: Duration,
}

impl HeaterState {
    pub fn new(setpoint: f64, now: Instant) -> Self {
        Self {
            setpoint,
            previous_setpoint: setpoint,
            pending_change: false,
            current_temp: 0.0,
            last_temp: 0.0,
            output: 0.0,
            gains: Gains::default(),
            control_mode: ControlMode::default(),
            sections: SectionBank::new([false; SECTION_COUNT]),
            is_auto: false,
            temp_trend: TempTrend::Stable,
            last_temp_update: None,
            last_section_change: now,
            timer_size: cascade::DEFAULT_TIMER_SIZE,
        }
    }

    pub fn has_reading(&self) -> bool {
        self.current_temp > 0.0
    }

    /// Accept a new temperature sample. Non-positive values are ignored.
    pub fn apply_temperature(&mut self, temp: f64, now: Instant) -> bool {
        if temp <= 0.0 || !temp.is_finite() {
            return false;
        }
        let delta = (temp - self.current_temp).abs();
        self.temp_trend = self.temp_trend.update(self.current_temp, temp);
        self.last_temp = self.current_temp;
        self.current_temp = temp;
        self.last_temp_update = Some(now);
        if delta >= trend::TREND_THRESHOLD {
            tracing::debug!("Temperature {:.1}°F -> {:.1}°F ({:?})", self.last_temp, temp, self.temp_trend);
        }
        true
    }

    /// Record a setpoint change, local or synchronized.
    pub fn apply_setpoint(&mut self, value: f64) {
        self.previous_setpoint = self.setpoint;
        self.setpoint = value;
        self.pending_change = false;
    }
}

/// Read-only projection handed to observers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HeaterSnapshot {
    pub name: String,
    pub setpoint: f64,
    pub previous_setpoint: f64,
    pub current_temp: f64,
    pub output: f64,
    pub gains: Gains,
    pub control_mode: ControlMode,
    pub sections: [bool; SECTION_COUNT],
    pub confirmed_sections: [Option<bool>; SECTION_COUNT],
    pub is_auto: bool,
    pub temp_trend: TempTrend,
    pub velocity: f64,
    pub pid: PidTerm,
    pub pulse_on_ms: Option<u64>,
    pub countdown: Countdown,
    pub max_temp: f64,
    pub ms_since_temp_update: Option<u64>,
    pub ms_since_section_change: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_temperature_rejects_invalid() {
        let now = Instant::now();
        let mut state = HeaterState::new(150.0, now);
        assert!(!state.apply_temperature(0.0, now));
        assert!(!state.apply_temperature(-3.0, now));
        assert!(!state.has_reading());
        assert!(state.apply_temperature(120.0, now));
        assert_eq!(state.current_temp, 120.0);
        assert_eq!(state.temp_trend, TempTrend::Stable);
        state.apply_temperature(121.0, now);
        assert_eq!(state.temp_trend, TempTrend::Rising);
        assert_eq!(state.last_temp, 120.0);
    }

    #[test]
    fn test_apply_setpoint_keeps_prior_value() {
        let now = Instant::now();
        let mut state = HeaterState::new(150.0, now);
        state.pending_change = true;
        state.apply_setpoint(200.0);
        assert_eq!(state.setpoint, 200.0);
        assert_eq!(state.previous_setpoint, 150.0);
        assert!(!state.pending_change);
    }

    #[test]
    fn test_reconcile_adopts_actuator_truth() {
        let now = Instant::now();
        let mut bank = SectionBank::new([true, true, false, false]);
        let grace = Duration::from_millis(1500);
        assert_eq!(bank.reconcile(0, true, false, grace, now), Reconciliation::InSync);
        assert_eq!(
            bank.reconcile(1, false, false, grace, now),
            Reconciliation::Adopted { index: 1, actual: false }
        );
        assert_eq!(bank.commanded(), [true, false, false, false]);
        assert_eq!(bank.confirmed()[1], Some(false));
        assert_eq!(bank.confirmed()[2], None);
    }

    #[test]
    fn test_reconcile_holds_primary() {
        let now = Instant::now();
        let mut bank = SectionBank::new([true, false, false, false]);
        let result = bank.reconcile(0, false, true, Duration::from_millis(1500), now);
        assert_eq!(result, Reconciliation::Reasserted { index: 0, commanded: true });
        assert!(bank.is_on(0));
    }

    #[test]
    fn test_reconcile_waits_for_fresh_command() {
        let now = Instant::now();
        let grace = Duration::from_millis(1500);
        let mut bank = SectionBank::new([true, false, false, false]);
        bank.command(2, true, now);
        assert_eq!(
            bank.reconcile(2, false, false, grace, now + Duration::from_millis(500)),
            Reconciliation::AwaitingConfirmation { index: 2 }
        );
        assert!(bank.is_on(2));
        assert_eq!(
            bank.reconcile(2, false, false, grace, now + Duration::from_millis(2000)),
            Reconciliation::Adopted { index: 2, actual: false }
        );
    }
}
