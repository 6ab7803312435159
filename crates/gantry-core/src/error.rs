//! Error taxonomy for the gantry drivers.
//!
//! `GantryError` is the one error type every library crate in the workspace
//! returns. Using `thiserror`, each variant carries enough context to be
//! reported to an operator without further decoration.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: the serial port or capture device could not be opened,
//!   or is already open under a conflicting configuration.
//! - **`Timeout`**: the motion wait loop never observed the controller's Idle
//!   state. Physical state is unknown after this error.
//! - **`ResolutionMismatch`**: camera and calibration disagree on frame size.
//! - **`TransientRead`**: one capture iteration failed. The capture loop absorbs
//!   these; they never cross the `FrameSource` boundary.
//! - **`Configuration`**: malformed or missing calibration artefact, or a
//!   configuration value that parses but makes no sense.
//! - **`Range`**: a move target lies outside the soft travel limits.
//! - **`SessionFailed`**: a session start or teardown sequence ran to the end
//!   but one or more of its steps failed.
//!
//! By using `#[from]`, I/O errors convert with the `?` operator.

use crate::limits::Axis;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the gantry error type.
pub type AppResult<T> = std::result::Result<T, GantryError>;

/// Which half of an armed session produced a [`GantryError::SessionFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Reset, zero work origin, units and positioning mode.
    Start,
    /// Home, re-home, close the port.
    Teardown,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionPhase::Start => "start",
            SessionPhase::Teardown => "teardown",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for the gantry workstation.
///
/// # Propagation
///
/// Connection and configuration errors are fatal at the call site that
/// triggered them. `Timeout` is the most important fatal condition: the
/// controller may still be moving, and the caller decides whether to retry,
/// reset or halt. `TransientRead` is only ever produced by capture devices and
/// is recovered inside the capture loop.
#[derive(Error, Debug)]
pub enum GantryError {
    /// Port or device cannot be opened, or is open with conflicting settings.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation attempted on a closed serial link.
    #[error("Serial port not connected")]
    NotConnected,

    /// The controller never reported Idle before the wait deadline.
    #[error("Controller did not return to Idle within {waited:?} (last status: {})", last_status.as_deref().unwrap_or("none"))]
    Timeout {
        /// How long the wait loop polled before giving up.
        waited: Duration,
        /// The last status line seen, if any.
        last_status: Option<String>,
    },

    /// Move target outside the configured soft limits.
    #[error("{axis} target {value} mm outside soft limits [{min}, {max}]")]
    Range {
        /// Offending axis.
        axis: Axis,
        /// Requested target in millimetres.
        value: f64,
        /// Lower soft limit.
        min: f64,
        /// Upper soft limit.
        max: f64,
    },

    /// Frame and calibration resolutions differ.
    #[error("Frame resolution {actual_width}x{actual_height} doesn't match calibration {expected_width}x{expected_height}")]
    #[allow(missing_docs)]
    ResolutionMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    /// A single capture iteration failed.
    #[error("Transient frame read failure: {0}")]
    TransientRead(String),

    /// Malformed or missing calibration artefact, or invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Standard I/O failure on the serial link or filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A session sequence completed every step but some of them failed.
    #[error("Session {phase} failed with {} error(s): {}", errors.len(), join_errors(errors))]
    SessionFailed {
        /// Which sequence failed.
        phase: SessionPhase,
        /// Every step failure, in the order they occurred.
        errors: Vec<GantryError>,
    },
}

fn join_errors(errors: &[GantryError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl GantryError {
    /// Build a resolution mismatch from `(width, height)` pairs.
    pub fn resolution_mismatch(expected: (u32, u32), actual: (u32, u32)) -> Self {
        GantryError::ResolutionMismatch {
            expected_width: expected.0,
            expected_height: expected.1,
            actual_width: actual.0,
            actual_height: actual.1,
        }
    }

    /// Whether the failure may clear up on its own and is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            GantryError::TransientRead(_) => true,
            GantryError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}
