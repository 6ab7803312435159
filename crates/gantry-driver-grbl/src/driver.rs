//! GRBL motion controller driver.
//!
//! Every public operation is synchronous and blocks the calling thread until
//! the controller reports completion or the wait deadline expires. The serial
//! protocol is half-duplex, so a driver is `&mut` for every command.
//!
//! # Usage
//!
//! ```rust,ignore
//! use gantry_driver_grbl::{AxisValues, GrblConfig, GrblDriver};
//!
//! let mut driver = GrblDriver::new(GrblConfig::default());
//! driver.run_session(|d| {
//!     d.move_absolute(AxisValues::xy(10.0, 5.0), 7000.0)?;
//!     d.move_relative(AxisValues::x(-2.0), 7000.0)?;
//!     Ok(())
//! })?;
//! ```

use crate::config::GrblConfig;
use crate::protocol::{ControllerStatus, GcodeCommand, STATUS_REQUEST};
use gantry_core::limits::Axis;
use gantry_core::serial::{open_serial, DynSerial, LineBuffer};
use gantry_core::{AppResult, GantryError};
use std::fmt;
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Whether the driver currently holds the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Open,
}

/// Logical (X, Y) position in millimetres as last confirmed by the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MachinePosition {
    pub x: f64,
    pub y: f64,
}

impl MachinePosition {
    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
        }
    }

    fn set(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
        }
    }
}

impl fmt::Display for MachinePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X={:.3} Y={:.3}", self.x, self.y)
    }
}

/// Per-axis move targets (absolute) or deltas (relative). Absent axes don't move.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AxisValues {
    pub x: Option<f64>,
    pub y: Option<f64>,
}

impl AxisValues {
    pub fn x(value: f64) -> Self {
        Self {
            x: Some(value),
            y: None,
        }
    }

    pub fn y(value: f64) -> Self {
        Self {
            x: None,
            y: Some(value),
        }
    }

    pub fn xy(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
        }
    }

    /// A single-axis value.
    pub fn axis(axis: Axis, value: f64) -> Self {
        match axis {
            Axis::X => Self::x(value),
            Axis::Y => Self::y(value),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_none() && self.y.is_none()
    }

    /// Present axes with their values.
    pub fn iter(&self) -> impl Iterator<Item = (Axis, f64)> {
        [(Axis::X, self.x), (Axis::Y, self.y)]
            .into_iter()
            .filter_map(|(axis, v)| v.map(|v| (axis, v)))
    }
}

/// How a move's wait loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MotionOutcome {
    /// Controller reported Idle; the recorded position was updated.
    Idle,
    /// Controller reported an alarm; the recorded position was left alone.
    Alarm(String),
}

impl MotionOutcome {
    pub fn is_idle(&self) -> bool {
        matches!(self, MotionOutcome::Idle)
    }
}

/// Settings a link was opened with. Reopening under different ones is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    /// Port path or simulator label
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Serial read timeout
    pub timeout: Duration,
}

impl LinkSettings {
    pub fn new(port: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout,
        }
    }
}

struct Link {
    port: DynSerial,
    settings: LinkSettings,
    lines: LineBuffer,
}

/// Driver for a GRBL-class controller on a serial link.
pub struct GrblDriver {
    config: GrblConfig,
    link: Option<Link>,
    position: MachinePosition,
}

impl GrblDriver {
    /// Create a closed driver. Nothing touches the port until [`open`](Self::open).
    pub fn new(config: GrblConfig) -> Self {
        Self {
            config,
            link: None,
            position: MachinePosition::default(),
        }
    }

    pub fn config(&self) -> &GrblConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        if self.link.is_some() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    /// Last confirmed position.
    pub fn position(&self) -> MachinePosition {
        self.position
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Open the port named in the configuration.
    pub fn open_configured(&mut self) -> AppResult<()> {
        let port = self.config.port.clone();
        self.open(&port, self.config.baud_rate, self.config.timeout())
    }

    /// Open a serial port and wait for the firmware to settle.
    ///
    /// Opening again with identical settings is a no-op.
    ///
    /// # Errors
    /// Returns [`GantryError::Connection`] if the port can't be opened or the
    /// driver is already open with different settings.
    #[instrument(skip(self), err)]
    pub fn open(&mut self, port: &str, baud_rate: u32, timeout: Duration) -> AppResult<()> {
        let settings = LinkSettings::new(port, baud_rate, timeout);
        if self.check_reopen(&settings)? {
            return Ok(());
        }
        let serial = open_serial(port, baud_rate, timeout, "GRBL")?;
        self.attach(settings, serial)
    }

    /// Adopt an already-open transport (a simulator, or a port opened elsewhere).
    ///
    /// Same reopen rules and settle delay as [`open`](Self::open).
    pub fn attach(&mut self, settings: LinkSettings, port: DynSerial) -> AppResult<()> {
        if self.check_reopen(&settings)? {
            return Ok(());
        }
        info!(port = %settings.port, baud = settings.baud_rate, "GRBL link opened");
        self.link = Some(Link {
            port,
            settings,
            lines: LineBuffer::default(),
        });

        let settle = self.config.settle_delay();
        if !settle.is_zero() {
            debug!(?settle, "Waiting for controller to settle");
            thread::sleep(settle);
        }
        self.drain_responses("connect")?;
        Ok(())
    }

    /// `Ok(true)` if already open with these settings.
    fn check_reopen(&self, settings: &LinkSettings) -> AppResult<bool> {
        match &self.link {
            None => Ok(false),
            Some(link) if link.settings == *settings => {
                debug!(port = %settings.port, "GRBL link already open");
                Ok(true)
            }
            Some(link) => Err(GantryError::Connection(format!(
                "GRBL link already open on {} @ {} baud; refusing to reopen as {} @ {} baud",
                link.settings.port,
                link.settings.baud_rate,
                settings.port,
                settings.baud_rate
            ))),
        }
    }

    /// Release the serial link. Closing a closed driver does nothing.
    pub fn close(&mut self) -> AppResult<()> {
        let Some(mut link) = self.link.take() else {
            return Ok(());
        };
        let flushed = link.port.flush();
        info!(port = %link.settings.port, "GRBL link closed");
        drop(link);
        flushed.map_err(GantryError::from)
    }

    fn link_mut(&mut self) -> AppResult<&mut Link> {
        self.link.as_mut().ok_or(GantryError::NotConnected)
    }

    // =========================================================================
    // Raw I/O
    // =========================================================================

    /// Write one command line. No acknowledgement is awaited.
    fn send(&mut self, command: &GcodeCommand) -> AppResult<()> {
        let line = command.to_string();
        let link = self.link_mut()?;
        debug!(command = %line, "[SEND]");
        link.port.write_all(line.as_bytes())?;
        link.port.write_all(b"\n")?;
        link.port.flush()?;
        Ok(())
    }

    /// Send an arbitrary line, fire-and-forget.
    #[instrument(skip(self), err)]
    pub fn send_raw(&mut self, line: &str) -> AppResult<()> {
        self.send(&GcodeCommand::Raw(line.to_string()))
    }

    /// Read and log whatever the controller has buffered.
    pub fn drain_responses(&mut self, context: &str) -> AppResult<Vec<String>> {
        let link = self.link_mut()?;
        let lines = link.lines.drain(link.port.as_mut())?;
        for line in &lines {
            debug!(context, %line, "[RESP]");
        }
        Ok(lines)
    }

    fn request_status(&mut self) -> AppResult<()> {
        let link = self.link_mut()?;
        link.port.write_all(&[STATUS_REQUEST])?;
        link.port.flush()?;
        Ok(())
    }

    // =========================================================================
    // Wait-for-completion
    // =========================================================================

    /// Send a motion command, then the sync directive, then wait for Idle.
    fn execute_move(&mut self, command: &GcodeCommand) -> AppResult<MotionOutcome> {
        self.send(command)?;
        self.send(&GcodeCommand::Sync)?;
        self.wait_for_idle()
    }

    /// Poll the controller until it reports Idle or Alarm.
    ///
    /// Each iteration sends a fresh status request, sleeps one poll interval
    /// and classifies every buffered line.
    ///
    /// # Errors
    /// [`GantryError::Timeout`] if neither marker arrives before the motion
    /// deadline. The machine may still be moving.
    #[instrument(skip(self), err)]
    pub fn wait_for_idle(&mut self) -> AppResult<MotionOutcome> {
        let deadline = self.config.motion_timeout();
        let poll = self.config.poll_interval();
        let start = Instant::now();
        let mut last_status = None;

        loop {
            self.request_status()?;
            thread::sleep(poll);

            let link = self.link_mut()?;
            for line in link.lines.drain(link.port.as_mut())? {
                debug!(%line, "[STATUS]");
                match ControllerStatus::parse(&line) {
                    ControllerStatus::Idle => return Ok(MotionOutcome::Idle),
                    ControllerStatus::Alarm => {
                        warn!(%line, "Controller reported alarm");
                        return Ok(MotionOutcome::Alarm(line));
                    }
                    ControllerStatus::Run | ControllerStatus::Unknown => {
                        last_status = Some(line);
                    }
                }
            }

            let waited = start.elapsed();
            if waited >= deadline {
                warn!(?waited, ?last_status, "Controller never reported Idle");
                return Err(GantryError::Timeout {
                    waited,
                    last_status,
                });
            }
        }
    }

    // =========================================================================
    // Motion commands
    // =========================================================================

    /// Validate a move before anything is written.
    ///
    /// Non-finite targets and feeds are rejected even with advisory limits;
    /// the controller would refuse them and stay Idle.
    fn check_move(&self, target: &AxisValues, feed: f64) -> AppResult<()> {
        if target.is_empty() {
            return Err(GantryError::Configuration(
                "move requires at least one axis".into(),
            ));
        }
        if !(feed.is_finite() && feed > 0.0) {
            return Err(GantryError::Configuration(format!(
                "feed rate must be a positive number, got {}",
                feed
            )));
        }
        for (axis, value) in target.iter() {
            if !value.is_finite() {
                let (min, max) = self.config.limits.bounds(axis);
                return Err(GantryError::Range {
                    axis,
                    value,
                    min,
                    max,
                });
            }
        }
        if self.config.enforce_soft_limits {
            for (axis, value) in target.iter() {
                self.config.limits.check(axis, value)?;
            }
        }
        Ok(())
    }

    /// Move to an absolute target and block until the controller settles.
    ///
    /// The recorded position changes only when the outcome is
    /// [`MotionOutcome::Idle`].
    #[instrument(skip(self), err)]
    pub fn move_absolute(&mut self, target: AxisValues, feed: f64) -> AppResult<MotionOutcome> {
        self.check_move(&target, feed)?;
        let outcome = self.execute_move(&GcodeCommand::LinearMove {
            x: target.x,
            y: target.y,
            feed,
        })?;
        if outcome.is_idle() {
            for (axis, value) in target.iter() {
                self.position.set(axis, value);
            }
            debug!(position = %self.position, "Move complete");
        }
        Ok(outcome)
    }

    /// [`move_absolute`](Self::move_absolute) at the configured feed rate.
    pub fn move_absolute_default(&mut self, target: AxisValues) -> AppResult<MotionOutcome> {
        self.move_absolute(target, self.config.feed_rate)
    }

    /// Move by a delta in relative mode, then restore absolute mode.
    ///
    /// `G90` is sent even when the move fails. If both the move and the
    /// restore fail, the move's error is returned.
    #[instrument(skip(self), err)]
    pub fn move_relative(&mut self, delta: AxisValues, feed: f64) -> AppResult<MotionOutcome> {
        let target = AxisValues {
            x: delta.x.map(|d| self.position.x + d),
            y: delta.y.map(|d| self.position.y + d),
        };
        self.check_move(&target, feed)?;

        let moved = self
            .send(&GcodeCommand::Millimetres)
            .and_then(|_| self.send(&GcodeCommand::Relative))
            .and_then(|_| {
                self.execute_move(&GcodeCommand::LinearMove {
                    x: delta.x,
                    y: delta.y,
                    feed,
                })
            });
        let restored = self.send(&GcodeCommand::Absolute);

        let outcome = match (moved, restored) {
            (Ok(outcome), Ok(())) => outcome,
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), Ok(())) => return Err(e),
            (Err(e), Err(restore)) => {
                warn!(error = %restore, "Failed to restore absolute mode");
                return Err(e);
            }
        };

        if outcome.is_idle() {
            for (axis, d) in delta.iter() {
                self.position.set(axis, self.position.get(axis) + d);
            }
            debug!(position = %self.position, "Relative move complete");
        }
        Ok(outcome)
    }

    /// [`move_relative`](Self::move_relative) at the configured feed rate.
    pub fn move_relative_default(&mut self, delta: AxisValues) -> AppResult<MotionOutcome> {
        self.move_relative(delta, self.config.feed_rate)
    }

    /// Start the homing cycle and reset the recorded position to the origin.
    ///
    /// Does not wait for Idle; the homing cycle reports completion differently.
    #[instrument(skip(self), err)]
    pub fn home(&mut self) -> AppResult<()> {
        self.send(&GcodeCommand::HomingCycle)?;
        self.position = MachinePosition::default();
        info!("Homing cycle started, position reset to origin");
        Ok(())
    }

    /// Clear the post-reset lock and log the controller's reply.
    #[instrument(skip(self), err)]
    pub fn unlock(&mut self) -> AppResult<()> {
        self.send(&GcodeCommand::HomingCycle)?;
        thread::sleep(self.config.poll_interval());
        self.drain_responses("unlock")?;
        Ok(())
    }

    /// Set the stored value of `axis` to 0 and drive it there.
    #[instrument(skip(self), err)]
    pub fn zero(&mut self, axis: Axis) -> AppResult<MotionOutcome> {
        self.position.set(axis, 0.0);
        self.move_absolute_default(AxisValues::axis(axis, 0.0))
    }

    /// Zero both axes with a single move.
    #[instrument(skip(self), err)]
    pub fn zero_all(&mut self) -> AppResult<MotionOutcome> {
        self.position = MachinePosition::default();
        self.move_absolute_default(AxisValues::xy(0.0, 0.0))
    }

    // =========================================================================
    // Session sequences
    // =========================================================================

    /// Record a failed step and keep going.
    fn collect(errors: &mut Vec<GantryError>, what: &str, step: AppResult<()>) {
        if let Err(e) = step {
            warn!(step = what, error = %e, "Session step failed");
            errors.push(e);
        }
    }

    /// Reset, zero the work origin, select millimetres and absolute mode.
    ///
    /// Every step runs even if an earlier one failed.
    pub(crate) fn start_sequence(&mut self) -> Vec<GantryError> {
        let mut errors = Vec::new();
        let r = self.unlock();
        Self::collect(&mut errors, "unlock", r);
        for command in [
            GcodeCommand::ResetOffsets,
            GcodeCommand::ZeroWorkOrigin,
            GcodeCommand::Millimetres,
            GcodeCommand::Absolute,
        ] {
            let label = command.to_string();
            let r = self.send(&command);
            Self::collect(&mut errors, &label, r);
            let r = self.drain_responses(&label).map(|_| ());
            Self::collect(&mut errors, &label, r);
        }
        if errors.is_empty() {
            self.position = MachinePosition::default();
            info!("Session armed");
        }
        errors
    }

    /// Home, wait, home again, close. The port is closed regardless.
    pub(crate) fn teardown_sequence(&mut self) -> Vec<GantryError> {
        let mut errors = Vec::new();
        let r = self.home();
        Self::collect(&mut errors, "home", r);
        thread::sleep(self.config.home_settle());
        let r = self.send(&GcodeCommand::HomingCycle);
        Self::collect(&mut errors, "re-home", r);
        let r = self.close();
        Self::collect(&mut errors, "close", r);
        info!(failures = errors.len(), "Session torn down");
        errors
    }
}

impl Drop for GrblDriver {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close GRBL link on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{IdleBehaviour, SimulatedController};

    fn quick_config() -> GrblConfig {
        GrblConfig {
            settle_delay_ms: 0,
            poll_interval_ms: 5,
            motion_timeout_ms: 100,
            home_settle_ms: 0,
            ..GrblConfig::default()
        }
    }

    fn attached(behaviour: IdleBehaviour) -> (GrblDriver, crate::simulator::SimulatorHandle) {
        let sim = SimulatedController::new(behaviour);
        let handle = sim.handle();
        let mut driver = GrblDriver::new(quick_config());
        driver
            .attach(sim.settings(), Box::new(sim))
            .expect("attach simulator");
        (driver, handle)
    }

    #[test]
    fn test_commands_fail_when_closed() {
        let mut driver = GrblDriver::new(quick_config());
        assert_eq!(driver.connection_state(), ConnectionState::Closed);
        assert!(matches!(
            driver.move_absolute(AxisValues::x(1.0), 100.0),
            Err(GantryError::NotConnected)
        ));
        assert!(matches!(driver.home(), Err(GantryError::NotConnected)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut driver, _) = attached(IdleBehaviour::ImmediateIdle);
        assert_eq!(driver.connection_state(), ConnectionState::Open);
        driver.close().unwrap();
        driver.close().unwrap();
        assert_eq!(driver.connection_state(), ConnectionState::Closed);
    }

    #[test]
    fn test_reopen_same_settings_is_noop() {
        let (mut driver, handle) = attached(IdleBehaviour::ImmediateIdle);
        let again = SimulatedController::new(IdleBehaviour::ImmediateIdle);
        driver.attach(again.settings(), Box::new(again)).unwrap();

        // The original link is still in use.
        driver.send_raw("$$").unwrap();
        assert_eq!(handle.received_lines(), vec!["$$"]);
    }

    #[test]
    fn test_reopen_conflicting_settings_fails() {
        let (mut driver, _) = attached(IdleBehaviour::ImmediateIdle);
        let other = SimulatedController::new(IdleBehaviour::ImmediateIdle);
        let settings = LinkSettings::new("sim://other", 9600, Duration::from_secs(1));
        let err = driver.attach(settings, Box::new(other)).unwrap_err();
        assert!(matches!(err, GantryError::Connection(_)));
    }

    #[test]
    fn test_move_sends_command_then_sync() {
        let (mut driver, handle) = attached(IdleBehaviour::ImmediateIdle);
        let outcome = driver.move_absolute(AxisValues::xy(10.0, 5.0), 7000.0).unwrap();
        assert_eq!(outcome, MotionOutcome::Idle);
        assert_eq!(handle.received_lines(), vec!["G1 X10 Y5 F7000", "G4 P0"]);
        assert!(handle.status_requests() >= 1);
    }

    #[test]
    fn test_single_axis_move_keeps_other_axis() {
        let (mut driver, _) = attached(IdleBehaviour::ImmediateIdle);
        driver.move_absolute(AxisValues::xy(3.0, 4.0), 500.0).unwrap();
        driver.move_absolute(AxisValues::y(-7.5), 500.0).unwrap();
        assert_eq!(driver.position(), MachinePosition { x: 3.0, y: -7.5 });
    }

    #[test]
    fn test_empty_move_rejected() {
        let (mut driver, handle) = attached(IdleBehaviour::ImmediateIdle);
        assert!(driver
            .move_absolute(AxisValues::default(), 100.0)
            .is_err());
        assert!(handle.received_lines().is_empty());
    }

    #[test]
    fn test_home_resets_position_without_waiting() {
        let (mut driver, handle) = attached(IdleBehaviour::ImmediateIdle);
        driver.move_absolute(AxisValues::xy(1.0, 2.0), 100.0).unwrap();
        let polls = handle.status_requests();
        driver.home().unwrap();
        assert_eq!(driver.position(), MachinePosition::default());
        assert_eq!(handle.status_requests(), polls);
        assert_eq!(handle.received_lines().last().unwrap(), "$H");
    }

    #[test]
    fn test_zero_single_axis() {
        let (mut driver, handle) = attached(IdleBehaviour::ImmediateIdle);
        driver.move_absolute(AxisValues::xy(4.0, 6.0), 100.0).unwrap();
        driver.zero(Axis::X).unwrap();
        assert_eq!(driver.position(), MachinePosition { x: 0.0, y: 6.0 });
        assert!(handle
            .received_lines()
            .contains(&"G1 X0 F7000".to_string()));
    }

    #[test]
    fn test_zero_all_issues_one_move() {
        let (mut driver, handle) = attached(IdleBehaviour::ImmediateIdle);
        driver.move_absolute(AxisValues::xy(4.0, 6.0), 100.0).unwrap();
        driver.zero_all().unwrap();
        assert_eq!(driver.position(), MachinePosition::default());
        let lines = handle.received_lines();
        assert_eq!(&lines[lines.len() - 2..], &["G1 X0 Y0 F7000", "G4 P0"]);
    }

    #[test]
    fn test_drain_responses_returns_ok_lines() {
        let (mut driver, _) = attached(IdleBehaviour::ImmediateIdle);
        driver.send_raw("G21").unwrap();
        let lines = driver.drain_responses("test").unwrap();
        assert_eq!(lines, vec!["ok"]);
    }
}
