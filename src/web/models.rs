//! Contains the data models for API requests and responses.

use crate::control::{GainPreset, Gains, HeaterSnapshot};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct SetpointRequest {
    pub value: f64,
}

#[derive(Serialize)]
pub struct SetpointResponse {
    pub setpoint: f64,
}

#[derive(Serialize)]
pub struct AutoResponse {
    pub is_auto: bool,
}

#[derive(Serialize)]
pub struct SectionResponse {
    /// One-based section number.
    pub section: usize,
    pub on: bool,
}

/// Either a named preset or all three gains.
#[derive(Deserialize)]
pub struct GainsRequest {
    #[serde(default)]
    pub preset: Option<GainPreset>,
    #[serde(default)]
    pub kp: Option<f64>,
    #[serde(default)]
    pub ki: Option<f64>,
    #[serde(default)]
    pub kd: Option<f64>,
}

impl GainsRequest {
    pub fn gains(&self) -> Option<Gains> {
        if let Some(preset) = self.preset {
            return Some(preset.gains());
        }
        Some(Gains {
            kp: self.kp?,
            ki: self.ki?,
            kd: self.kd?,
        })
    }
}

#[derive(Deserialize)]
pub struct TimerRequest {
    pub milliseconds: u64,
}

#[derive(Serialize)]
pub struct TimerResponse {
    pub milliseconds: u64,
}

#[derive(Serialize)]
pub struct HeaterListResponse {
    pub heaters: Vec<HeaterSnapshot>,
}

#[derive(Serialize)]
pub struct IngestResponse {
    pub device: String,
    pub value: f64,
}
