//! Continuously refreshed frame slot backed by a dedicated capture thread.
//!
//! The capture thread reads each frame into a private back buffer and then
//! swaps it into the shared slot under a short write lock. Readers take a
//! read lock only long enough to copy the slot, so they never block each other
//! and never see a half-written frame. Undistortion runs on the copy, outside
//! the lock.

use crate::calibration::CalibrationModel;
use crate::config::CameraConfig;
use crate::device::{open_device, CaptureDevice, CaptureRequest};
use gantry_core::{AppResult, Frame, GantryError, Resolution};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Name given to the capture thread.
pub const CAPTURE_THREAD_NAME: &str = "frame-capture";

/// Settings for [`FrameSource::start`].
#[derive(Debug, Clone)]
pub struct FrameSourceOptions {
    /// Format, size and rate to request from the device
    pub request: CaptureRequest,
    /// Sleep between successful captures
    pub idle_delay: Duration,
    /// Sleep after a failed capture
    pub retry_backoff: Duration,
    /// Undistortion model; its resolution must match the negotiated one
    pub calibration: Option<CalibrationModel>,
}

impl Default for FrameSourceOptions {
    fn default() -> Self {
        let config = CameraConfig::default();
        Self {
            request: CaptureRequest::default(),
            idle_delay: config.idle_delay(),
            retry_backoff: config.retry_backoff(),
            calibration: None,
        }
    }
}

impl FrameSourceOptions {
    /// Options from configuration, loading the calibration artefact if one is named.
    pub fn from_config(config: &CameraConfig) -> AppResult<Self> {
        let calibration = config
            .calibration
            .as_ref()
            .map(|path| CalibrationModel::load(path))
            .transpose()?;
        Ok(Self {
            request: config.request()?,
            idle_delay: config.idle_delay(),
            retry_backoff: config.retry_backoff(),
            calibration,
        })
    }
}

/// Capture counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames published to the slot
    pub frames_captured: u64,
    /// Device reads that failed and were retried
    pub transient_failures: u64,
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    failures: AtomicU64,
}

/// Latest-frame buffer fed by a background capture thread.
pub struct FrameSource {
    slot: Arc<RwLock<Frame>>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    worker: Option<JoinHandle<Option<Box<dyn CaptureDevice>>>>,
    resolution: Resolution,
    calibration: Option<Arc<CalibrationModel>>,
    device_name: String,
}

impl FrameSource {
    /// Open the configured hardware device and start capturing.
    pub fn open(config: &CameraConfig) -> AppResult<Self> {
        let options = FrameSourceOptions::from_config(config)?;
        let device = open_device(&config.device_id()?)?;
        Self::start(device, options)
    }

    /// Configure `device`, validate it against the calibration and spawn the
    /// capture thread.
    ///
    /// # Errors
    /// - Whatever `configure` returns
    /// - [`GantryError::ResolutionMismatch`] if the negotiated resolution
    ///   differs from the calibration's; the device is released first
    #[instrument(skip_all, fields(device = %device.describe()), err)]
    pub fn start(
        mut device: Box<dyn CaptureDevice>,
        options: FrameSourceOptions,
    ) -> AppResult<Self> {
        let resolution = device.configure(&options.request)?;
        if resolution != options.request.resolution {
            info!(
                requested = %options.request.resolution,
                actual = %resolution,
                "Device adjusted capture resolution"
            );
        }

        if let Some(model) = &options.calibration {
            if model.resolution() != resolution {
                let expected = model.resolution();
                if let Err(e) = device.release() {
                    warn!(error = %e, "Failed to release device after mismatch");
                }
                return Err(GantryError::resolution_mismatch(
                    (expected.width, expected.height),
                    (resolution.width, resolution.height),
                ));
            }
        }

        let builder = thread::Builder::new().name(CAPTURE_THREAD_NAME.to_string());
        Self::launch(device, resolution, options, builder)
    }

    /// Spawn the capture thread and hand it the configured device.
    ///
    /// The device only moves to the thread once the spawn has succeeded, so a
    /// failed spawn still releases it.
    fn launch(
        mut device: Box<dyn CaptureDevice>,
        resolution: Resolution,
        options: FrameSourceOptions,
        builder: thread::Builder,
    ) -> AppResult<Self> {
        let slot = Arc::new(RwLock::new(Frame::zeroed(resolution)));
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());
        let device_name = device.describe();
        let (handoff, inbox) = mpsc::sync_channel::<Box<dyn CaptureDevice>>(1);

        let spawned = {
            let slot = Arc::clone(&slot);
            let running = Arc::clone(&running);
            let counters = Arc::clone(&counters);
            let idle = options.idle_delay;
            let backoff = options.retry_backoff;
            builder.spawn(move || {
                let device = inbox.recv().ok()?;
                Some(capture_loop(
                    device, resolution, slot, running, counters, idle, backoff,
                ))
            })
        };
        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                if let Err(release) = device.release() {
                    warn!(error = %release, "Failed to release device after spawn failure");
                }
                return Err(e.into());
            }
        };
        if let Err(mpsc::SendError(mut device)) = handoff.send(device) {
            // Receiver gone: the thread has already exited.
            running.store(false, Ordering::Release);
            let _ = worker.join();
            device.release()?;
            return Err(GantryError::Io(std::io::Error::other(
                "capture thread exited before receiving the device",
            )));
        }

        info!(
            device = %device_name,
            %resolution,
            undistort = options.calibration.is_some(),
            "Capture started"
        );
        Ok(Self {
            slot,
            running,
            counters,
            worker: Some(worker),
            resolution,
            calibration: options.calibration.map(Arc::new),
            device_name,
        })
    }

    /// Copy of the current frame, undistorted when a calibration is loaded.
    ///
    /// If undistortion fails the raw frame is returned and the failure logged.
    pub fn get_image(&self) -> Frame {
        let raw = self.get_raw_image();
        match &self.calibration {
            None => raw,
            Some(model) => match model.undistort(&raw) {
                Ok(corrected) => corrected,
                Err(e) => {
                    warn!(error = %e, "Undistortion failed, returning raw frame");
                    raw
                }
            },
        }
    }

    /// Copy of the current frame without correction.
    pub fn get_raw_image(&self) -> Frame {
        self.slot.read().clone()
    }

    /// Negotiated capture resolution.
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn calibration(&self) -> Option<&CalibrationModel> {
        self.calibration.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.counters.frames.load(Ordering::Relaxed),
            transient_failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Stop the capture thread, wait for it and release the device.
    ///
    /// Later calls do nothing. The last captured frame stays readable.
    #[instrument(skip(self), fields(device = %self.device_name), err)]
    pub fn stop(&mut self) -> AppResult<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::Release);
        let device = worker.join().map_err(|_| {
            GantryError::Io(std::io::Error::other("capture thread panicked"))
        })?;
        if let Some(mut device) = device {
            device.release()?;
        }
        info!(stats = ?self.stats(), "Capture stopped");
        Ok(())
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Failed to stop frame source on drop");
        }
    }
}

fn capture_loop(
    mut device: Box<dyn CaptureDevice>,
    resolution: Resolution,
    slot: Arc<RwLock<Frame>>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    idle: Duration,
    backoff: Duration,
) -> Box<dyn CaptureDevice> {
    let mut back = Frame::zeroed(resolution);
    let mut failing = false;

    while running.load(Ordering::Acquire) {
        let result = device.read_into(&mut back).and_then(|()| {
            if back.resolution() == resolution {
                Ok(())
            } else {
                Err(GantryError::TransientRead(format!(
                    "device delivered {} instead of {}",
                    back.resolution(),
                    resolution
                )))
            }
        });

        match result {
            Ok(()) => {
                std::mem::swap(&mut *slot.write(), &mut back);
                counters.frames.fetch_add(1, Ordering::Relaxed);
                if failing {
                    info!("Frame capture recovered");
                    failing = false;
                }
                thread::sleep(idle);
            }
            Err(e) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                if failing {
                    debug!(error = %e, "Frame read failed again");
                } else {
                    warn!(error = %e, "Frame read failed, retrying");
                    failing = true;
                }
                if back.resolution() != resolution {
                    back = Frame::zeroed(resolution);
                }
                thread::sleep(backoff);
            }
        }
    }
    debug!("Capture loop exited");
    device
}
