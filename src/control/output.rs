// src/control/output.rs - Power output calculation (full power vs stepped modulation)
use serde::{Deserialize, Serialize};

/// Errors larger than this (°F) run the heater flat out or not at all.
pub const FULL_POWER_BAND: f64 = 10.0;
/// No output inside this band around the setpoint.
pub const DEADBAND: f64 = 0.5;
/// Minimum output while the heater is still more than 1°F below setpoint.
pub const MIN_HEATING_OUTPUT: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMode {
    FullPower,
    #[default]
    #[serde(alias = "PID")]
    Modulated,
}

impl std::fmt::Display for ControlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlMode::FullPower => write!(f, "FULL_POWER"),
            ControlMode::Modulated => write!(f, "MODULATED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Default for Gains {
    fn default() -> Self {
        Self {
            kp: 2.0,
            ki: 0.1,
            kd: 0.05,
        }
    }
}

/// Named gain sets offered to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GainPreset {
    Conservative,
    Balanced,
    Aggressive,
    Stable,
}

impl GainPreset {
    pub fn gains(self) -> Gains {
        match self {
            GainPreset::Conservative => Gains { kp: 2.0, ki: 0.05, kd: 0.5 },
            GainPreset::Balanced => Gains { kp: 3.0, ki: 0.1, kd: 0.3 },
            GainPreset::Aggressive => Gains { kp: 5.0, ki: 0.2, kd: 0.1 },
            GainPreset::Stable => Gains { kp: 1.5, ki: 0.02, kd: 1.0 },
        }
    }
}

/// Classic PID term, tracked for diagnostics only. It never drives the output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PidTerm {
    pub integral: f64,
    pub last_error: f64,
    pub value: f64,
}

impl PidTerm {
    fn update(&mut self, error: f64, gains: &Gains) {
        self.integral += error;
        let derivative = error - self.last_error;
        let raw = gains.kp * error + gains.ki * self.integral + gains.kd * derivative;
        self.value = raw.clamp(0.0, 100.0);
        self.last_error = error;
    }

    pub fn reset(&mut self) {
        *self = PidTerm::default();
    }
}

/// Computes the heater output once per control tick.
#[derive(Debug, Clone, Default)]
pub struct OutputCalculator {
    pid: PidTerm,
}

impl OutputCalculator {
    pub fn new() -> Self {
        Self {
            pid: PidTerm::default(),
        }
    }

    pub fn compute(
        &mut self,
        setpoint: f64,
        current_temp: f64,
        previous_output: f64,
        gains: &Gains,
        velocity: f64,
    ) -> (f64, ControlMode) {
        let error = setpoint - current_temp;
        if error.abs() > FULL_POWER_BAND {
            // Leaving or staying in full power wipes the integrator
            self.pid.reset();
            let output = if error > 0.0 { 100.0 } else { 0.0 };
            return (output, ControlMode::FullPower);
        }
        self.pid.update(error, gains);
        let output = stepped_output(error, previous_output, velocity);
        (output.clamp(0.0, 100.0), ControlMode::Modulated)
    }

    pub fn pid(&self) -> PidTerm {
        self.pid
    }

    pub fn reset(&mut self) {
        self.pid.reset();
    }
}

/// Step size for the band the current output sits in.
pub fn step_size(output: f64) -> f64 {
    if output >= 20.0 {
        20.0
    } else if output >= 10.0 {
        10.0
    } else if output >= 5.0 {
        5.0
    } else {
        1.0
    }
}

/// Velocity-aware stepped modulation used within 10°F of the setpoint.
///
/// `error` is `setpoint - current` and `velocity` is in °F/s.
pub fn stepped_output(error: f64, current: f64, velocity: f64) -> f64 {
    let abs_error = error.abs();
    if abs_error <= DEADBAND {
        return 0.0;
    }

    let step = step_size(current);
    let increase = |by: f64| (current + by).min(100.0);
    let decrease_to = |by: f64, floor: f64| (current - by).max(floor);

    let mut output = if error > 0.0 {
        if velocity < -0.05 {
            increase(step)
        } else if velocity > 0.1 {
            decrease_to(step, MIN_HEATING_OUTPUT)
        } else if velocity > 0.02 {
            decrease_to(step / 2.0, MIN_HEATING_OUTPUT)
        } else if velocity < -0.02 {
            increase(step)
        } else if current < 30.0 {
            increase(step)
        } else if abs_error < 5.0 {
            decrease_to(step / 2.0, MIN_HEATING_OUTPUT)
        } else {
            current
        }
    } else if velocity > 0.05 {
        decrease_to(step, 0.0)
    } else {
        decrease_to(step / 2.0, 0.0)
    };

    if error > 1.0 && output < MIN_HEATING_OUTPUT {
        output = MIN_HEATING_OUTPUT;
    }
    output
}
