//! Opening the workstation's hardware, real or simulated.

use gantry_camera::{FrameSource, FrameSourceOptions, SimulatedCamera};
use gantry_core::{AppResult, Frame, GantryError, Resolution};
use gantry_driver_grbl::{GrblConfig, GrblDriver, IdleBehaviour, SimulatedController};
use image::RgbImage;
use std::path::Path;
use tracing::{info, warn};

use crate::config::GantryConfig;

/// Where commands are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Serial port and camera named in the configuration
    Hardware,
    /// In-memory controller and camera
    Simulated,
}

/// A driver with an open link.
pub fn connect_motion(config: &GrblConfig, backend: Backend) -> AppResult<GrblDriver> {
    let mut driver = GrblDriver::new(config.clone());
    match backend {
        Backend::Hardware => driver.open_configured()?,
        Backend::Simulated => {
            let sim = SimulatedController::new(IdleBehaviour::ImmediateIdle);
            driver.attach(sim.settings(), Box::new(sim))?;
        }
    }
    Ok(driver)
}

/// Run one command on an open link, then close it.
///
/// The command's result is returned even when closing fails; a close failure
/// is only logged.
pub fn run_and_close<T>(
    driver: &mut GrblDriver,
    op: impl FnOnce(&mut GrblDriver) -> AppResult<T>,
) -> AppResult<T> {
    let result = op(driver);
    if let Err(e) = driver.close() {
        warn!(error = %e, "Failed to close GRBL link");
    }
    result
}

/// A running frame source.
///
/// The simulated camera's sensor is exactly the requested size, so a
/// calibration made for that size applies.
pub fn open_frames(config: &GantryConfig, backend: Backend) -> AppResult<FrameSource> {
    match backend {
        Backend::Hardware => FrameSource::open(&config.camera),
        Backend::Simulated => {
            let options = FrameSourceOptions::from_config(&config.camera)?;
            let camera = SimulatedCamera::new(options.request.resolution);
            FrameSource::start(Box::new(camera), options)
        }
    }
}

/// Write a frame as PNG.
pub fn save_png(frame: &Frame, path: &Path) -> AppResult<()> {
    let Resolution { width, height } = frame.resolution();
    let image = RgbImage::from_raw(width, height, frame.data.clone()).ok_or_else(|| {
        GantryError::Configuration(format!("frame buffer does not hold {}x{} RGB", width, height))
    })?;
    image
        .save(path)
        .map_err(|e| GantryError::Io(std::io::Error::other(e)))?;
    info!(path = %path.display(), %width, %height, "Snapshot written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::serial::SerialPortIO;
    use gantry_driver_grbl::{AxisValues, ConnectionState, LinkSettings};
    use std::io::{self, Read, Write};
    use std::time::Duration;
    use tracing_test::traced_test;

    /// Accepts writes, but every flush fails.
    struct FailingFlush;

    impl Read for FailingFlush {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for FailingFlush {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "cable unplugged"))
        }
    }

    impl SerialPortIO for FailingFlush {
        fn bytes_available(&mut self) -> io::Result<usize> {
            Ok(0)
        }
    }

    fn failing_flush_driver() -> GrblDriver {
        let config = GrblConfig {
            settle_delay_ms: 0,
            ..GrblConfig::default()
        };
        let mut driver = GrblDriver::new(config);
        driver
            .attach(
                LinkSettings::new("broken://grbl", 115_200, Duration::from_secs(1)),
                Box::new(FailingFlush),
            )
            .unwrap();
        driver
    }

    #[traced_test]
    #[test]
    fn test_command_error_wins_over_close_error() {
        let mut driver = failing_flush_driver();
        let result: AppResult<()> = run_and_close(&mut driver, |_| {
            Err(GantryError::Configuration("feed rate must be positive".into()))
        });

        match result {
            Err(GantryError::Configuration(msg)) => assert!(msg.contains("feed rate")),
            other => panic!("expected the command's error, got {:?}", other),
        }
        assert_eq!(driver.connection_state(), ConnectionState::Closed);
        assert!(logs_contain("Failed to close GRBL link"));
    }

    #[traced_test]
    #[test]
    fn test_close_error_does_not_hide_success() {
        let mut driver = failing_flush_driver();
        let value = run_and_close(&mut driver, |_| Ok(7)).unwrap();

        assert_eq!(value, 7);
        assert_eq!(driver.connection_state(), ConnectionState::Closed);
        assert!(logs_contain("Failed to close GRBL link"));
    }

    #[test]
    fn test_simulated_motion_is_open() {
        let config = GrblConfig {
            settle_delay_ms: 0,
            poll_interval_ms: 5,
            ..GrblConfig::default()
        };
        let mut driver = connect_motion(&config, Backend::Simulated).unwrap();
        assert_eq!(driver.connection_state(), ConnectionState::Open);
        assert!(driver.move_absolute_default(AxisValues::x(3.0)).unwrap().is_idle());
        assert_eq!(driver.position().x, 3.0);
    }
}
