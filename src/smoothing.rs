//! Smoothing and debounce state for battery readings.
//!
//! Raw probe results are noisy: the firmware reports values that jitter by a
//! few percent and single reads are dropped regularly. This module keeps a
//! short rolling history of successful readings and only reports the device
//! as absent after several consecutive failures.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of successful readings kept for the moving average.
pub const HISTORY_CAPACITY: usize = 5;

/// Consecutive failed probes needed before the value is cleared.
pub const DEBOUNCE_THRESHOLD: u32 = 3;

/// The value exposed to other processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayedValue {
    /// Smoothed battery percentage (0-100).
    Present(u8),
    /// No device, or the debounce threshold was reached.
    #[default]
    Absent,
}

impl DisplayedValue {
    /// Plain-text token written to the status file.
    pub fn token(&self) -> String {
        match self {
            DisplayedValue::Present(pct) => format!("{}%", pct),
            DisplayedValue::Absent => "N/A".to_string(),
        }
    }

    pub fn percentage(&self) -> Option<u8> {
        match self {
            DisplayedValue::Present(pct) => Some(*pct),
            DisplayedValue::Absent => None,
        }
    }
}

/// Structured form of [`DisplayedValue`] persisted as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub percentage: u8,
    pub is_present: bool,
}

impl From<DisplayedValue> for StatusRecord {
    fn from(value: DisplayedValue) -> Self {
        match value {
            DisplayedValue::Present(pct) => Self {
                percentage: pct,
                is_present: true,
            },
            DisplayedValue::Absent => Self {
                percentage: 0,
                is_present: false,
            },
        }
    }
}

/// Bounded FIFO of recent successful readings.
#[derive(Debug, Clone)]
pub struct ReadingHistory {
    readings: VecDeque<u8>,
    capacity: usize,
}

impl ReadingHistory {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            readings: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a reading, evicting the oldest one when full.
    pub fn push(&mut self, pct: u8) {
        if self.readings.len() >= self.capacity {
            self.readings.pop_front();
        }
        self.readings.push_back(pct);
    }

    /// Rounded arithmetic mean of the history, or `None` when empty.
    ///
    /// Ties round to the even neighbour, matching the firmware tool the
    /// status files were originally produced by.
    pub fn rounded_mean(&self) -> Option<u8> {
        if self.readings.is_empty() {
            return None;
        }
        let len = self.readings.len() as u32;
        let sum: u32 = self.readings.iter().map(|&r| r as u32).sum();
        let (quotient, remainder) = (sum / len, sum % len);

        let rounded = match (2 * remainder).cmp(&len) {
            std::cmp::Ordering::Less => quotient,
            std::cmp::Ordering::Greater => quotient + 1,
            std::cmp::Ordering::Equal => quotient + (quotient & 1),
        };
        Some(rounded as u8)
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn clear(&mut self) {
        self.readings.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &u8> {
        self.readings.iter()
    }
}

impl Default for ReadingHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns probe results into a flicker-free displayed value.
#[derive(Debug, Clone, Default)]
pub struct BatteryState {
    history: ReadingHistory,
    consecutive_failures: u32,
    displayed: DisplayedValue,
}

impl BatteryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a single reading carried over from a previous run.
    pub fn seeded(pct: u8) -> Self {
        let mut state = Self::new();
        state.history.push(pct);
        state.displayed = DisplayedValue::Present(pct);
        state
    }

    /// Feed one probe result and return the value to display.
    pub fn ingest(&mut self, reading: Option<u8>) -> DisplayedValue {
        match reading {
            Some(pct) => {
                self.history.push(pct);
                self.consecutive_failures = 0;
                self.displayed = self
                    .history
                    .rounded_mean()
                    .map(DisplayedValue::Present)
                    .unwrap_or(DisplayedValue::Absent);
            }
            None => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= DEBOUNCE_THRESHOLD {
                    self.history.clear();
                    self.displayed = DisplayedValue::Absent;
                }
                // Below the threshold the previous value stays on screen.
            }
        }
        self.displayed
    }

    pub fn displayed(&self) -> DisplayedValue {
        self.displayed
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn history(&self) -> &ReadingHistory {
        &self.history
    }
}
