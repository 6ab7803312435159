//! Capture device seam.
//!
//! A [`CaptureDevice`] is anything that can be configured once and then read
//! synchronously, one frame at a time. The capture thread owns the device for
//! its whole life and hands it back on shutdown so it can be released.

use gantry_core::{AppResult, Frame, GantryError, Resolution};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Camera identifier: a numeric index or a device path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceId {
    /// `/dev/video{n}` on Linux
    Index(u32),
    /// Explicit device path
    Path(PathBuf),
}

impl FromStr for DeviceId {
    type Err = GantryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(GantryError::Configuration(
                "camera device identifier is empty".into(),
            ));
        }
        Ok(match s.parse::<u32>() {
            Ok(index) => DeviceId::Index(index),
            Err(_) => DeviceId::Path(PathBuf::from(s)),
        })
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Index(i) => write!(f, "camera #{}", i),
            DeviceId::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

/// What we ask the device for. The device may clamp any of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Pixel format as a four-character code (e.g. `MJPG`)
    pub fourcc: [u8; 4],
    /// Requested frame size
    pub resolution: Resolution,
    /// Requested frames per second
    pub fps: u32,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            fourcc: *b"MJPG",
            resolution: Resolution::new(8000, 6000),
            fps: 5,
        }
    }
}

impl CaptureRequest {
    /// Fourcc as text, for logs.
    pub fn fourcc_str(&self) -> String {
        String::from_utf8_lossy(&self.fourcc).into_owned()
    }
}

/// A synchronous single-frame source.
pub trait CaptureDevice: Send {
    /// Apply the request and return the resolution the device actually chose.
    fn configure(&mut self, request: &CaptureRequest) -> AppResult<Resolution>;

    /// Read the next frame into `frame`, resizing it if needed.
    ///
    /// Failures should be [`GantryError::TransientRead`]; the capture loop
    /// retries every error regardless.
    fn read_into(&mut self, frame: &mut Frame) -> AppResult<()>;

    /// Give the device back to the system. Called once, after the last read.
    fn release(&mut self) -> AppResult<()> {
        Ok(())
    }

    /// Human-readable name for logs.
    fn describe(&self) -> String;
}

/// Open a hardware capture device.
///
/// # Errors
/// [`GantryError::Connection`] if the device can't be opened, or if this
/// build has no hardware backend.
pub fn open_device(id: &DeviceId) -> AppResult<Box<dyn CaptureDevice>> {
    #[cfg(feature = "v4l")]
    {
        let camera = crate::v4l_device::V4lCamera::open(id)?;
        Ok(Box::new(camera))
    }
    #[cfg(not(feature = "v4l"))]
    {
        Err(GantryError::Connection(format!(
            "cannot open {}: built without the `v4l` feature",
            id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_parsing() {
        assert_eq!("4".parse::<DeviceId>().unwrap(), DeviceId::Index(4));
        assert_eq!(
            "/dev/video2".parse::<DeviceId>().unwrap(),
            DeviceId::Path(PathBuf::from("/dev/video2"))
        );
        assert!("  ".parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_default_request() {
        let req = CaptureRequest::default();
        assert_eq!(req.fourcc_str(), "MJPG");
        assert_eq!(req.resolution, Resolution::new(8000, 6000));
        assert_eq!(req.fps, 5);
    }

    #[cfg(not(feature = "v4l"))]
    #[test]
    fn test_hardware_needs_feature() {
        let err = open_device(&DeviceId::Index(0)).err().unwrap();
        assert!(matches!(err, GantryError::Connection(_)));
        assert!(err.to_string().contains("v4l"));
    }
}
