//! Messages accepted by a controller instance's state task.

use super::ControlError;
use crate::control::{Gains, HeaterSnapshot, SECTION_COUNT};
use tokio::sync::oneshot;
use tokio::time::Duration;

/// Everything that may change a heater's state arrives as one of these.
#[derive(Debug)]
pub enum ControllerCommand {
    /// A temperature sample from the push feed or the polling fallback.
    Temperature(f64),
    /// Actuator read-back for ports 1-4; `None` where the read failed.
    Reconcile {
        readings: [Option<bool>; SECTION_COUNT],
    },
    SetSetpoint {
        value: f64,
        respond_to: oneshot::Sender<Result<f64, ControlError>>,
    },
    /// Flip automatic cascade mode. Responds with the new mode.
    ToggleAuto {
        respond_to: oneshot::Sender<bool>,
    },
    /// Flip one section (zero-based). Responds with its new commanded state.
    ToggleSection {
        index: usize,
        respond_to: oneshot::Sender<Result<bool, ControlError>>,
    },
    SetGains {
        gains: Gains,
        respond_to: oneshot::Sender<Result<Gains, ControlError>>,
    },
    SetTimerSize {
        timer_size: Duration,
        respond_to: oneshot::Sender<Result<Duration, ControlError>>,
    },
    GetSnapshot {
        respond_to: oneshot::Sender<HeaterSnapshot>,
    },
    /// Stop all tasks and switch the analog channel off.
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}
