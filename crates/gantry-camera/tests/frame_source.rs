//! Concurrency and lifecycle tests for `FrameSource`.

use gantry_camera::*;
use gantry_core::{Frame, GantryError, Resolution};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn options(resolution: Resolution) -> FrameSourceOptions {
    FrameSourceOptions {
        request: CaptureRequest {
            resolution,
            ..CaptureRequest::default()
        },
        idle_delay: Duration::from_millis(1),
        retry_backoff: Duration::from_millis(2),
        calibration: None,
    }
}

fn wait_for_frames(source: &FrameSource, count: u64) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while source.stats().frames_captured < count {
        assert!(Instant::now() < deadline, "capture thread made no progress");
        thread::sleep(Duration::from_millis(2));
    }
}

fn fisheye(resolution: Resolution) -> CalibrationModel {
    let (w, h) = (resolution.width as f64, resolution.height as f64);
    let k = [[w / 2.0, 0.0, w / 2.0], [0.0, w / 2.0, h / 2.0], [0.0, 0.0, 1.0]];
    CalibrationModel::new(k, &[0.02, 0.0, 0.0, 0.0], resolution, Some(0.4)).unwrap()
}

#[test]
fn test_concurrent_readers_never_see_torn_frames() {
    // Flat frames: every byte of a complete frame has the same value.
    let cam = SimulatedCamera::new(Resolution::new(320, 240));
    let source = Arc::new(
        FrameSource::start(Box::new(cam), options(Resolution::new(320, 240))).unwrap(),
    );
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..6)
        .map(|_| {
            let source = Arc::clone(&source);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut checked = 0u32;
                while !done.load(Ordering::Relaxed) {
                    let frame = source.get_image();
                    let first = frame.data[0];
                    assert!(
                        frame.data.iter().all(|&b| b == first),
                        "torn frame observed"
                    );
                    checked += 1;
                }
                checked
            })
        })
        .collect();

    wait_for_frames(&source, 50);
    done.store(true, Ordering::Relaxed);
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
}

#[test]
fn test_frames_advance_while_running() {
    let cam = SimulatedCamera::new(Resolution::new(16, 16));
    let source = FrameSource::start(Box::new(cam), options(Resolution::new(16, 16))).unwrap();
    wait_for_frames(&source, 3);
    let a = source.get_raw_image().data[0];
    wait_for_frames(&source, source.stats().frames_captured + 2);
    let b = source.get_raw_image().data[0];
    assert_ne!(a, b);
}

#[test]
fn test_stop_then_get_image_returns_last_frame() {
    let cam = SimulatedCamera::new(Resolution::new(16, 16));
    let released = cam.released_flag();
    let mut source = FrameSource::start(Box::new(cam), options(Resolution::new(16, 16))).unwrap();
    wait_for_frames(&source, 5);

    source.stop().unwrap();
    assert!(!source.is_running());
    assert!(released.load(Ordering::SeqCst));

    let captured = source.stats().frames_captured;
    let first = source.get_image();
    thread::sleep(Duration::from_millis(20));
    let second = source.get_image();
    assert_eq!(first, second);
    assert_eq!(source.stats().frames_captured, captured);
    assert_eq!(first.data[0], (captured % 256) as u8);
}

#[test]
fn test_drop_stops_capture_thread() {
    let cam = SimulatedCamera::new(Resolution::new(8, 8));
    let released = cam.released_flag();
    {
        let source = FrameSource::start(Box::new(cam), options(Resolution::new(8, 8))).unwrap();
        wait_for_frames(&source, 1);
    }
    assert!(released.load(Ordering::SeqCst));
}

#[test]
fn test_transient_failures_are_absorbed() {
    let cam = SimulatedCamera::new(Resolution::new(8, 8)).with_failure_every(2);
    let mut source = FrameSource::start(Box::new(cam), options(Resolution::new(8, 8))).unwrap();
    wait_for_frames(&source, 10);
    assert!(source.is_running());
    source.stop().unwrap();

    let stats = source.stats();
    assert!(stats.transient_failures >= 9, "{:?}", stats);
    // Every published frame is complete despite the dropouts.
    let frame = source.get_raw_image();
    assert!(frame.data.iter().all(|&b| b == frame.data[0]));
}

#[test]
fn test_calibration_mismatch_fails_at_construction() {
    // Sensor clamps to 64x48, calibration says 80x60.
    let cam = SimulatedCamera::new(Resolution::new(64, 48));
    let released = cam.released_flag();
    let mut opts = options(Resolution::new(80, 60));
    opts.calibration = Some(fisheye(Resolution::new(80, 60)));

    match FrameSource::start(Box::new(cam), opts) {
        Err(GantryError::ResolutionMismatch {
            expected_width,
            actual_width,
            ..
        }) => {
            assert_eq!(expected_width, 80);
            assert_eq!(actual_width, 64);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("mismatch accepted"),
    }
    assert!(released.load(Ordering::SeqCst));
}

#[test]
fn test_get_image_applies_undistortion() {
    let res = Resolution::new(64, 48);
    let cam = SimulatedCamera::new(res).with_pattern(TestPattern::Gradient);
    let mut opts = options(res);
    opts.calibration = Some(fisheye(res));
    let mut source = FrameSource::start(Box::new(cam), opts).unwrap();
    wait_for_frames(&source, 2);
    source.stop().unwrap();

    let raw = source.get_raw_image();
    let corrected = source.get_image();
    assert_eq!(corrected.resolution(), raw.resolution());
    assert_ne!(corrected, raw);
    let expected = source.calibration().unwrap().undistort(&raw).unwrap();
    assert_eq!(corrected, expected);
}

#[test]
fn test_snapshot_is_a_copy() {
    let cam = SimulatedCamera::new(Resolution::new(8, 8));
    let mut source = FrameSource::start(Box::new(cam), options(Resolution::new(8, 8))).unwrap();
    wait_for_frames(&source, 1);
    source.stop().unwrap();

    let mut mine: Frame = source.get_raw_image();
    mine.data.fill(0xAB);
    assert_ne!(source.get_raw_image().data[0], 0xAB);
}
