//! GRBL wire protocol: outgoing G-code lines and incoming status lines.
//!
//! Protocol overview:
//! - Format: newline-terminated ASCII G-code, one command per line
//! - Baud: 115200, 8N1, no flow control
//! - Status: the real-time byte `?` (no newline) makes the controller print
//!   `<State|MPos:x,y,z|...>`
//! - Alarms: lines such as `ALARM:1` or a `<Alarm|...>` status report

use std::fmt;

/// Real-time status request. Sent bare, never newline-terminated.
pub const STATUS_REQUEST: u8 = b'?';

/// Controller state derived from one response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    /// Motion complete, planner empty.
    Idle,
    /// Moving, jogging or homing.
    Run,
    /// Hard stop or limit condition.
    Alarm,
    /// Anything else (`ok`, banners, settings echo).
    Unknown,
}

impl ControllerStatus {
    /// Classify a trimmed response line.
    pub fn parse(line: &str) -> Self {
        if line.starts_with("<Idle") {
            ControllerStatus::Idle
        } else if line.contains("ALARM") || line.starts_with("<Alarm") {
            ControllerStatus::Alarm
        } else if line.starts_with("<Run")
            || line.starts_with("<Jog")
            || line.starts_with("<Home")
        {
            ControllerStatus::Run
        } else {
            ControllerStatus::Unknown
        }
    }
}

/// Commands the driver sends, rendered to their G-code text by `Display`.
#[derive(Debug, Clone, PartialEq)]
pub enum GcodeCommand {
    /// `$H` homing cycle. Also clears the post-reset lock.
    HomingCycle,
    /// `$RST=#` clears work coordinate offsets.
    ResetOffsets,
    /// `G10 P0 L20 X0 Y0` makes the current location the work origin.
    ZeroWorkOrigin,
    /// `G21` millimetre units.
    Millimetres,
    /// `G90` absolute positioning.
    Absolute,
    /// `G91` relative positioning.
    Relative,
    /// `G1` linear move; absent axes are omitted.
    LinearMove {
        /// X word, if any.
        x: Option<f64>,
        /// Y word, if any.
        y: Option<f64>,
        /// Feed rate in mm/min.
        feed: f64,
    },
    /// `G4 P0`, executed only once the planner buffer has drained.
    Sync,
    /// Caller-supplied line, sent verbatim.
    Raw(String),
}

impl fmt::Display for GcodeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcodeCommand::HomingCycle => f.write_str("$H"),
            GcodeCommand::ResetOffsets => f.write_str("$RST=#"),
            GcodeCommand::ZeroWorkOrigin => f.write_str("G10 P0 L20 X0 Y0"),
            GcodeCommand::Millimetres => f.write_str("G21"),
            GcodeCommand::Absolute => f.write_str("G90"),
            GcodeCommand::Relative => f.write_str("G91"),
            GcodeCommand::LinearMove { x, y, feed } => {
                f.write_str("G1")?;
                if let Some(x) = x {
                    write!(f, " X{}", x)?;
                }
                if let Some(y) = y {
                    write!(f, " Y{}", y)?;
                }
                write!(f, " F{}", feed)
            }
            GcodeCommand::Sync => f.write_str("G4 P0"),
            GcodeCommand::Raw(line) => f.write_str(line.trim_end()),
        }
    }
}
