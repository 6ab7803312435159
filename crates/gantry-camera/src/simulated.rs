//! Deterministic in-process camera.

use crate::device::{CaptureDevice, CaptureRequest};
use gantry_core::data::CHANNELS;
use gantry_core::{AppResult, Frame, GantryError, Resolution};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// What the simulated sensor draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// Every byte equals the frame counter (mod 256).
    Flat,
    /// Red ramps left to right, green top to bottom, blue is the frame counter.
    Gradient,
}

/// Simulated camera with clamping, optional delay and failure injection.
pub struct SimulatedCamera {
    max_resolution: Resolution,
    resolution: Resolution,
    pattern: TestPattern,
    frame_delay: Duration,
    fail_every: Option<u64>,
    reads: u64,
    frames: Arc<AtomicU64>,
    released: Arc<AtomicBool>,
}

impl SimulatedCamera {
    /// A camera whose sensor is at most `max_resolution`.
    pub fn new(max_resolution: Resolution) -> Self {
        Self {
            max_resolution,
            resolution: max_resolution,
            pattern: TestPattern::Flat,
            frame_delay: Duration::ZERO,
            fail_every: None,
            reads: 0,
            frames: Arc::new(AtomicU64::new(0)),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Sleep this long inside every read, like a sensor readout.
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    /// Fail every `n`-th read with a transient error. `0` disables.
    pub fn with_failure_every(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    /// Set once [`CaptureDevice::release`] has run.
    pub fn released_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.released)
    }

    /// Count of frames produced so far.
    pub fn frame_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.frames)
    }

    fn draw(&self, frame: &mut Frame, counter: u64) {
        let level = (counter % 256) as u8;
        match self.pattern {
            TestPattern::Flat => frame.data.fill(level),
            TestPattern::Gradient => {
                let w = frame.width.max(1) as usize;
                let h = frame.height.max(1) as usize;
                for (i, px) in frame.data.chunks_exact_mut(CHANNELS).enumerate() {
                    let (x, y) = (i % w, i / w);
                    px[0] = (x * 255 / w) as u8;
                    px[1] = (y * 255 / h) as u8;
                    px[2] = level;
                }
            }
        }
    }
}

impl CaptureDevice for SimulatedCamera {
    fn configure(&mut self, request: &CaptureRequest) -> AppResult<Resolution> {
        if request.resolution.width == 0 || request.resolution.height == 0 {
            return Err(GantryError::Configuration(format!(
                "requested capture size {} is empty",
                request.resolution
            )));
        }
        self.resolution = Resolution::new(
            request.resolution.width.min(self.max_resolution.width),
            request.resolution.height.min(self.max_resolution.height),
        );
        Ok(self.resolution)
    }

    fn read_into(&mut self, frame: &mut Frame) -> AppResult<()> {
        if !self.frame_delay.is_zero() {
            thread::sleep(self.frame_delay);
        }
        self.reads += 1;
        if let Some(n) = self.fail_every {
            if self.reads % n == 0 {
                return Err(GantryError::TransientRead(format!(
                    "simulated dropout on read {}",
                    self.reads
                )));
            }
        }

        if frame.resolution() != self.resolution {
            *frame = Frame::zeroed(self.resolution);
        }
        let counter = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
        self.draw(frame, counter);
        Ok(())
    }

    fn release(&mut self) -> AppResult<()> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("simulated camera ({} max)", self.max_resolution)
    }
}
