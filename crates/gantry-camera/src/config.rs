//! Camera configuration.

use crate::device::{CaptureRequest, DeviceId};
use gantry_core::limits::{CAPTURE_IDLE_DELAY, CAPTURE_RETRY_BACKOFF};
use gantry_core::{AppResult, GantryError, Resolution};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the frame source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Device index ("4" or 4) or path ("/dev/video4")
    #[serde(deserialize_with = "index_or_path")]
    pub device: String,
    /// Optional `.json` / `.npz` calibration artefact
    pub calibration: Option<PathBuf>,
    /// Requested width in pixels (the device may clamp)
    pub width: u32,
    /// Requested height in pixels (the device may clamp)
    pub height: u32,
    /// Requested frame rate
    pub fps: u32,
    /// Requested pixel format
    pub fourcc: String,
    /// Sleep between successful captures, ms
    pub idle_delay_ms: u64,
    /// Sleep after a failed capture, ms
    pub retry_backoff_ms: u64,
}

/// Accept `device = 4` as well as `device = "4"`.
fn index_or_path<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Index(u64),
        Text(String),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Index(i) => i.to_string(),
        Raw::Text(s) => s,
    })
}

impl Default for CameraConfig {
    fn default() -> Self {
        let request = CaptureRequest::default();
        Self {
            device: "4".to_string(),
            calibration: None,
            width: request.resolution.width,
            height: request.resolution.height,
            fps: request.fps,
            fourcc: request.fourcc_str(),
            idle_delay_ms: CAPTURE_IDLE_DELAY.as_millis() as u64,
            retry_backoff_ms: CAPTURE_RETRY_BACKOFF.as_millis() as u64,
        }
    }
}

impl CameraConfig {
    pub fn device_id(&self) -> AppResult<DeviceId> {
        self.device.parse()
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// The capture request this configuration describes.
    pub fn request(&self) -> AppResult<CaptureRequest> {
        let fourcc: [u8; 4] = self.fourcc.as_bytes().try_into().map_err(|_| {
            GantryError::Configuration(format!(
                "camera.fourcc must be exactly 4 ASCII characters, got {:?}",
                self.fourcc
            ))
        })?;
        Ok(CaptureRequest {
            fourcc,
            resolution: Resolution::new(self.width, self.height),
            fps: self.fps,
        })
    }

    pub fn validate(&self) -> AppResult<()> {
        self.device_id()?;
        self.request()?;
        if self.width == 0 || self.height == 0 {
            return Err(GantryError::Configuration(format!(
                "camera resolution {}x{} is empty",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(GantryError::Configuration(
                "camera.fps must be positive".into(),
            ));
        }
        if self.retry_backoff_ms == 0 {
            return Err(GantryError::Configuration(
                "camera.retry_backoff_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CameraConfig::default();
        assert_eq!(cfg.device_id().unwrap(), DeviceId::Index(4));
        assert_eq!(cfg.request().unwrap(), CaptureRequest::default());
        assert_eq!(cfg.idle_delay(), Duration::from_millis(1));
        assert_eq!(cfg.retry_backoff(), Duration::from_millis(50));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_bad_fourcc() {
        let cfg = CameraConfig {
            fourcc: "MJPEG".into(),
            ..CameraConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(GantryError::Configuration(_))));
    }

    #[test]
    fn test_toml_with_path_device() {
        let cfg: CameraConfig = toml::from_str(
            r#"
            device = "/dev/video0"
            calibration = "calib/fisheye.json"
            width = 1920
            height = 1080
            "#,
        )
        .unwrap();
        assert_eq!(
            cfg.device_id().unwrap(),
            DeviceId::Path(PathBuf::from("/dev/video0"))
        );
        assert_eq!(cfg.fps, 5);
        assert_eq!(cfg.calibration, Some(PathBuf::from("calib/fisheye.json")));
    }

    #[test]
    fn test_integer_device_index() {
        let cfg: CameraConfig = toml::from_str("device = 2").unwrap();
        assert_eq!(cfg.device_id().unwrap(), DeviceId::Index(2));
    }
}
