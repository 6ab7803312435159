//! Driver configuration.

use gantry_core::limits::{
    SoftLimits, DEFAULT_BAUD_RATE, DEFAULT_FEED_RATE, HOME_SETTLE, MOTION_TIMEOUT,
    SERIAL_TIMEOUT, SETTLE_DELAY, STATUS_POLL_INTERVAL,
};
use gantry_core::{AppResult, GantryError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the GRBL driver.
///
/// Every field has a default, so an empty `[motion]` table is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrblConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate (default: 115200)
    pub baud_rate: u32,
    /// Serial read timeout in milliseconds (default: 2000)
    pub timeout_ms: u64,
    /// Wait after opening the port before sending commands (default: 2000)
    pub settle_delay_ms: u64,
    /// Interval between status requests while waiting for Idle (default: 200)
    pub poll_interval_ms: u64,
    /// Deadline for a move to reach Idle (default: 5000)
    pub motion_timeout_ms: u64,
    /// Feed rate used when the caller doesn't pick one, mm/min (default: 7000)
    pub feed_rate: f64,
    /// Reject out-of-range targets before sending them (default: true)
    pub enforce_soft_limits: bool,
    /// Soft travel limits (default: ±1000 mm on both axes)
    pub limits: SoftLimits,
    /// Pause between the two homing commands at session end (default: 1000)
    pub home_settle_ms: u64,
}

impl Default for GrblConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: SERIAL_TIMEOUT.as_millis() as u64,
            settle_delay_ms: SETTLE_DELAY.as_millis() as u64,
            poll_interval_ms: STATUS_POLL_INTERVAL.as_millis() as u64,
            motion_timeout_ms: MOTION_TIMEOUT.as_millis() as u64,
            feed_rate: DEFAULT_FEED_RATE,
            enforce_soft_limits: true,
            limits: SoftLimits::default(),
            home_settle_ms: HOME_SETTLE.as_millis() as u64,
        }
    }
}

impl GrblConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn motion_timeout(&self) -> Duration {
        Duration::from_millis(self.motion_timeout_ms)
    }

    pub fn home_settle(&self) -> Duration {
        Duration::from_millis(self.home_settle_ms)
    }

    /// Semantic checks that serde can't express.
    pub fn validate(&self) -> AppResult<()> {
        if self.port.trim().is_empty() {
            return Err(GantryError::Configuration(
                "motion.port must not be empty".into(),
            ));
        }
        if self.baud_rate == 0 {
            return Err(GantryError::Configuration(
                "motion.baud_rate must be positive".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(GantryError::Configuration(
                "motion.poll_interval_ms must be positive".into(),
            ));
        }
        if self.motion_timeout_ms < self.poll_interval_ms {
            return Err(GantryError::Configuration(format!(
                "motion.motion_timeout_ms ({}) is shorter than one poll interval ({})",
                self.motion_timeout_ms, self.poll_interval_ms
            )));
        }
        if !(self.feed_rate.is_finite() && self.feed_rate > 0.0) {
            return Err(GantryError::Configuration(format!(
                "motion.feed_rate must be a positive number, got {}",
                self.feed_rate
            )));
        }
        self.limits.validate()
    }
}
