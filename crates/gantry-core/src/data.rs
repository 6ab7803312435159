//! Frame and resolution types shared by the camera pipeline.

use crate::error::{AppResult, GantryError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of interleaved 8-bit channels per pixel.
pub const CHANNELS: usize = 3;

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Resolution {
    /// Create a resolution.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Pixel count.
    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Byte length of a frame at this resolution.
    pub fn frame_bytes(&self) -> usize {
        self.pixels() * CHANNELS
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A single 8-bit, 3-channel image, row-major, channels interleaved.
///
/// Channel order is whatever the device produced (RGB for decoded MJPEG).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Raw pixel data, `height * width * 3` bytes
    pub data: Vec<u8>,
}

impl Frame {
    /// Wrap pixel data, checking the buffer length against the dimensions.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> AppResult<Self> {
        let expected = Resolution::new(width, height).frame_bytes();
        if data.len() != expected {
            return Err(GantryError::Configuration(format!(
                "frame buffer holds {} bytes, {}x{}x{} needs {}",
                data.len(),
                width,
                height,
                CHANNELS,
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// All-black frame of the given resolution.
    pub fn zeroed(resolution: Resolution) -> Self {
        Self {
            width: resolution.width,
            height: resolution.height,
            data: vec![0; resolution.frame_bytes()],
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * CHANNELS
    }

    /// Pixel at `(x, y)`, or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; CHANNELS]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = y as usize * self.stride() + x as usize * CHANNELS;
        let px = self.data.get(offset..offset + CHANNELS)?;
        Some([px[0], px[1], px[2]])
    }
}
