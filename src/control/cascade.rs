// src/control/cascade.rs - Dual-timer cascade of heater sections
//!
//! Sections are added one at a time while the output sits at 100% for a full
//! timer period and removed one at a time while it sits at 0%. Section 1
//! (index 0) is never removed here.

use serde::Serialize;
use tokio::time::{Duration, Instant};

pub const SECTION_COUNT: usize = 4;
pub const DEFAULT_TIMER_SIZE: Duration = Duration::from_millis(15_000);
pub const MIN_TIMER_SIZE: Duration = Duration::from_millis(5_000);
pub const MAX_TIMER_SIZE: Duration = Duration::from_millis(120_000);

/// A section transition decided by the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionChange {
    Add(usize),
    Remove(usize),
}

impl SectionChange {
    pub fn index(&self) -> usize {
        match self {
            SectionChange::Add(i) | SectionChange::Remove(i) => *i,
        }
    }

    pub fn energize(&self) -> bool {
        matches!(self, SectionChange::Add(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NextAction {
    Add,
    Remove,
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CascadeState {
    Idle,
    AddTimerRunning,
    RemoveTimerRunning,
}

/// Read-only view of the running timer for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Countdown {
    pub next_action: NextAction,
    pub remaining_ms: u64,
    pub timer_size_ms: u64,
}

pub fn active_sections(sections: &[bool; SECTION_COUNT]) -> usize {
    sections.iter().filter(|s| **s).count()
}

#[derive(Debug, Clone)]
pub struct CascadeSectionManager {
    timer_size: Duration,
    high_power_start: Option<Instant>,
    low_power_start: Option<Instant>,
}

impl Default for CascadeSectionManager {
    fn default() -> Self {
        Self::new(DEFAULT_TIMER_SIZE)
    }
}

impl CascadeSectionManager {
    pub fn new(timer_size: Duration) -> Self {
        Self {
            timer_size: timer_size.clamp(MIN_TIMER_SIZE, MAX_TIMER_SIZE),
            high_power_start: None,
            low_power_start: None,
        }
    }

    pub fn timer_size(&self) -> Duration {
        self.timer_size
    }

    /// Change the hysteresis duration. Running timers keep their start time.
    pub fn set_timer_size(&mut self, timer_size: Duration) {
        self.timer_size = timer_size.clamp(MIN_TIMER_SIZE, MAX_TIMER_SIZE);
    }

    pub fn reset(&mut self) {
        self.high_power_start = None;
        self.low_power_start = None;
    }

    pub fn state(&self) -> CascadeState {
        if self.high_power_start.is_some() {
            CascadeState::AddTimerRunning
        } else if self.low_power_start.is_some() {
            CascadeState::RemoveTimerRunning
        } else {
            CascadeState::Idle
        }
    }

    /// Evaluate one control tick. Returns the section change to apply, if any.
    pub fn evaluate(&mut self, output: f64, sections: &[bool; SECTION_COUNT], now: Instant) -> Option<SectionChange> {
        let active = active_sections(sections);

        if output >= 100.0 && active < SECTION_COUNT {
            match self.high_power_start {
                None => {
                    if sections.iter().any(|s| !s) {
                        self.high_power_start = Some(now);
                        tracing::debug!("Add timer started with {}/{} sections active", active, SECTION_COUNT);
                    }
                }
                Some(started) => {
                    if now.saturating_duration_since(started) >= self.timer_size {
                        self.high_power_start = None;
                        if let Some(index) = sections.iter().position(|s| !s) {
                            return Some(SectionChange::Add(index));
                        }
                    }
                }
            }
        } else if self.high_power_start.is_some() {
            tracing::debug!("Add timer cancelled (output {:.1}%, {} active)", output, active);
            self.high_power_start = None;
        }

        if output <= 0.0 && active > 1 {
            match self.low_power_start {
                None => {
                    if sections[1..].iter().any(|s| *s) {
                        self.low_power_start = Some(now);
                        tracing::debug!("Remove timer started with {}/{} sections active", active, SECTION_COUNT);
                    }
                }
                Some(started) => {
                    if now.saturating_duration_since(started) >= self.timer_size {
                        self.low_power_start = None;
                        if let Some(index) = (1..SECTION_COUNT).rev().find(|i| sections[*i]) {
                            return Some(SectionChange::Remove(index));
                        }
                    }
                }
            }
        } else if self.low_power_start.is_some() {
            tracing::debug!("Remove timer cancelled (output {:.1}%, {} active)", output, active);
            self.low_power_start = None;
        }

        None
    }

    pub fn countdown(&self, now: Instant) -> Countdown {
        let timer_size_ms = self.timer_size.as_millis() as u64;
        let mut countdown = Countdown {
            next_action: NextAction::None,
            remaining_ms: timer_size_ms,
            timer_size_ms,
        };
        let running = [
            (self.high_power_start, NextAction::Add),
            (self.low_power_start, NextAction::Remove),
        ];
        for (start, action) in running {
            if let Some(started) = start {
                let elapsed = now.saturating_duration_since(started);
                if elapsed < self.timer_size {
                    countdown.next_action = action;
                    countdown.remaining_ms = (self.timer_size - elapsed).as_millis() as u64;
                }
            }
        }
        countdown
    }
}
