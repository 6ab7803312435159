//! Frame acquisition for the gantry workstation.
//!
//! - [`FrameSource`]: owns a capture thread that keeps the latest frame in a
//!   shared slot; any number of threads may snapshot it
//! - [`CalibrationModel`]: fisheye intrinsics and the precomputed remap used
//!   to undistort snapshots
//! - [`CaptureDevice`]: the seam between the capture loop and a camera, with
//!   a [`SimulatedCamera`] and, behind the `v4l` feature, a V4L2 backend
//!
//! # Example
//!
//! ```rust,ignore
//! use gantry_camera::{CameraConfig, FrameSource};
//!
//! let mut source = FrameSource::open(&CameraConfig::default())?;
//! let frame = source.get_image();
//! println!("{}x{}", frame.width, frame.height);
//! source.stop()?;
//! ```

pub mod calibration;
pub mod config;
pub mod device;
pub mod frame_source;
pub mod simulated;
#[cfg(feature = "v4l")]
pub mod v4l_device;

pub use calibration::CalibrationModel;
pub use config::CameraConfig;
pub use device::{open_device, CaptureDevice, CaptureRequest, DeviceId};
pub use frame_source::{CaptureStats, FrameSource, FrameSourceOptions};
pub use simulated::{SimulatedCamera, TestPattern};
#[cfg(feature = "v4l")]
pub use v4l_device::V4lCamera;
