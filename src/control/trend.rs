// src/control/trend.rs - Windowed temperature history and trend detection
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

/// Samples older than this are dropped on every `record`.
pub const HISTORY_WINDOW: Duration = Duration::from_secs(10);
/// Velocity is measured across the samples inside this sub-window.
pub const VELOCITY_WINDOW: Duration = Duration::from_secs(5);
/// Minimum change (°F) before the trend is allowed to flip.
pub const TREND_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TempTrend {
    Rising,
    Falling,
    #[default]
    Stable,
}

impl TempTrend {
    /// Hysteretic trend update.
    ///
    /// Only a change of at least [`TREND_THRESHOLD`] against the previous sample
    /// moves the trend; smaller changes keep `self`. A `previous` of zero means
    /// there was no reading yet, so the first real sample never sets a trend.
    pub fn update(self, previous: f64, current: f64) -> TempTrend {
        if previous <= 0.0 {
            return self;
        }
        let delta = current - previous;
        if delta.abs() >= TREND_THRESHOLD {
            if delta > 0.0 {
                TempTrend::Rising
            } else {
                TempTrend::Falling
            }
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    temp: f64,
}

/// Rolling 10 second history used to derive temperature velocity.
#[derive(Debug, Clone, Default)]
pub struct TemperatureTrendTracker {
    history: VecDeque<Sample>,
}

impl TemperatureTrendTracker {
    pub fn new() -> Self {
        Self {
            history: VecDeque::new(),
        }
    }

    pub fn record(&mut self, temp: f64, now: Instant) {
        self.history.push_back(Sample { at: now, temp });
        while let Some(front) = self.history.front() {
            if now.saturating_duration_since(front.at) >= HISTORY_WINDOW {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Rate of change in °F/s over the last five seconds, or 0 without enough data.
    pub fn velocity(&self, now: Instant) -> f64 {
        let mut recent = self
            .history
            .iter()
            .filter(|s| now.saturating_duration_since(s.at) < VELOCITY_WINDOW);
        let Some(oldest) = recent.next() else {
            return 0.0;
        };
        let Some(newest) = recent.last() else {
            return 0.0;
        };
        let dt = newest.at.saturating_duration_since(oldest.at).as_secs_f64();
        if dt > 0.0 {
            (newest.temp - oldest.temp) / dt
        } else {
            0.0
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}
