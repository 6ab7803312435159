//! V4L2 capture backend.
//!
//! Requests MJPEG from the driver and decodes each buffer to RGB with `image`.
//! Only built with the `v4l` feature.

use crate::device::{CaptureDevice, CaptureRequest, DeviceId};
use gantry_core::{AppResult, Frame, GantryError, Resolution};
use image::ImageFormat;
use tracing::{debug, info};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

/// Number of mmap buffers queued with the driver.
const BUFFER_COUNT: u32 = 4;

/// A V4L2 camera opened by index or path.
pub struct V4lCamera {
    id: DeviceId,
    device: Device,
    stream: Option<Stream<'static>>,
    resolution: Resolution,
    fourcc: FourCC,
}

impl V4lCamera {
    /// Open the device node.
    pub fn open(id: &DeviceId) -> AppResult<Self> {
        let device = match id {
            DeviceId::Index(i) => Device::new(*i as usize),
            DeviceId::Path(p) => Device::with_path(p),
        }
        .map_err(|e| GantryError::Connection(format!("Failed to open {}: {}", id, e)))?;
        Ok(Self {
            id: id.clone(),
            device,
            stream: None,
            resolution: Resolution::new(0, 0),
            fourcc: FourCC::new(b"MJPG"),
        })
    }

    fn decode(&self, buf: &[u8], frame: &mut Frame) -> AppResult<()> {
        let rgb = if self.fourcc == FourCC::new(b"MJPG") {
            image::load_from_memory_with_format(buf, ImageFormat::Jpeg)
                .map_err(|e| GantryError::TransientRead(format!("MJPEG decode failed: {}", e)))?
                .to_rgb8()
        } else {
            return Err(GantryError::TransientRead(format!(
                "unsupported pixel format {}",
                self.fourcc
            )));
        };
        let (w, h) = rgb.dimensions();
        *frame = Frame::new(w, h, rgb.into_raw())?;
        Ok(())
    }
}

impl CaptureDevice for V4lCamera {
    fn configure(&mut self, request: &CaptureRequest) -> AppResult<Resolution> {
        let connection = |e: std::io::Error| {
            GantryError::Connection(format!("{}: format negotiation failed: {}", self.id, e))
        };
        let mut format = self.device.format().map_err(connection)?;
        format.width = request.resolution.width;
        format.height = request.resolution.height;
        format.fourcc = FourCC::new(&request.fourcc);
        let actual = self.device.set_format(&format).map_err(connection)?;
        self.device
            .set_params(&Parameters::with_fps(request.fps))
            .map_err(connection)?;

        self.fourcc = actual.fourcc;
        self.resolution = Resolution::new(actual.width, actual.height);
        info!(
            device = %self.id,
            requested = %request.resolution,
            actual = %self.resolution,
            fourcc = %actual.fourcc,
            fps = request.fps,
            "Camera configured"
        );

        let stream = Stream::with_buffers(&self.device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(connection)?;
        self.stream = Some(stream);
        Ok(self.resolution)
    }

    fn read_into(&mut self, frame: &mut Frame) -> AppResult<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| GantryError::TransientRead("camera not configured".into()))?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| GantryError::TransientRead(format!("dequeue failed: {}", e)))?;
        let used = (meta.bytesused as usize).min(buf.len());
        let bytes = buf[..used].to_vec();
        self.decode(&bytes, frame)
    }

    fn release(&mut self) -> AppResult<()> {
        if self.stream.take().is_some() {
            debug!(device = %self.id, "Capture stream stopped");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("V4L2 {}", self.id)
    }
}
