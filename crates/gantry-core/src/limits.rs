//! Machine travel limits and timing constants.
//!
//! This module centralizes:
//! - Soft travel limits for the X/Y gantry
//! - Timing constants for the controller protocol and the capture loop
//!
//! The configuration layer uses these as defaults; drivers never hard-code
//! their own copies.

use crate::error::{AppResult, GantryError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// =============================================================================
// Axes
// =============================================================================

/// A linear axis of the gantry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Horizontal axis.
    X,
    /// Depth axis.
    Y,
}

impl Axis {
    /// G-code word letter for this axis.
    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

// =============================================================================
// Travel Limits
// =============================================================================

/// Lower X travel bound in millimetres.
pub const X_MIN: f64 = -1000.0;
/// Upper X travel bound in millimetres.
pub const X_MAX: f64 = 1000.0;
/// Lower Y travel bound in millimetres.
pub const Y_MIN: f64 = -1000.0;
/// Upper Y travel bound in millimetres.
pub const Y_MAX: f64 = 1000.0;

/// Soft travel bounds. The firmware does not know about these.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoftLimits {
    /// Lower X bound (mm).
    pub x_min: f64,
    /// Upper X bound (mm).
    pub x_max: f64,
    /// Lower Y bound (mm).
    pub y_min: f64,
    /// Upper Y bound (mm).
    pub y_max: f64,
}

impl Default for SoftLimits {
    fn default() -> Self {
        Self {
            x_min: X_MIN,
            x_max: X_MAX,
            y_min: Y_MIN,
            y_max: Y_MAX,
        }
    }
}

impl SoftLimits {
    /// Bounds for one axis as `(min, max)`.
    pub fn bounds(&self, axis: Axis) -> (f64, f64) {
        match axis {
            Axis::X => (self.x_min, self.x_max),
            Axis::Y => (self.y_min, self.y_max),
        }
    }

    /// Reject `value` if it lies outside the bounds of `axis`.
    ///
    /// NaN is always out of range.
    pub fn check(&self, axis: Axis, value: f64) -> AppResult<()> {
        let (min, max) = self.bounds(axis);
        if value >= min && value <= max {
            Ok(())
        } else {
            Err(GantryError::Range {
                axis,
                value,
                min,
                max,
            })
        }
    }

    /// Ensure each bound pair is ordered.
    pub fn validate(&self) -> AppResult<()> {
        for axis in [Axis::X, Axis::Y] {
            let (min, max) = self.bounds(axis);
            if !(min < max) {
                return Err(GantryError::Configuration(format!(
                    "{} soft limits are not ordered: min {} >= max {}",
                    axis, min, max
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Controller Timing
// =============================================================================

/// Wait after opening the port before the firmware accepts commands (2 seconds).
///
/// GRBL boards reset when the port opens and print a banner.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Interval between status requests in the motion wait loop (200 ms).
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Overall deadline for a move to report Idle (5 seconds).
pub const MOTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Serial read timeout (2 seconds).
pub const SERIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause between the two homing commands during teardown (1 second).
pub const HOME_SETTLE: Duration = Duration::from_secs(1);

/// Controller baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Feed rate used when the caller does not pick one (mm/min).
pub const DEFAULT_FEED_RATE: f64 = 7000.0;

// =============================================================================
// Capture Timing
// =============================================================================

/// Sleep between successful capture iterations (1 ms).
pub const CAPTURE_IDLE_DELAY: Duration = Duration::from_millis(1);

/// Backoff after a failed device read (50 ms).
pub const CAPTURE_RETRY_BACKOFF: Duration = Duration::from_millis(50);
