//! End-to-end motion scenarios against the simulated controller.
//!
//! These tests drive `GrblDriver` through its public API only and inspect the
//! simulator afterwards to check what actually went over the wire.

use gantry_core::limits::Axis;
use gantry_core::serial::SerialPortIO;
use gantry_core::{AppResult, GantryError, SessionPhase};
use gantry_driver_grbl::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serial_test::serial;
use std::io::{self, Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing_test::traced_test;

fn fast_config() -> GrblConfig {
    GrblConfig {
        settle_delay_ms: 0,
        poll_interval_ms: 2,
        motion_timeout_ms: 200,
        home_settle_ms: 0,
        ..GrblConfig::default()
    }
}

fn driver_with(config: GrblConfig, behaviour: IdleBehaviour) -> (GrblDriver, SimulatorHandle) {
    let sim = SimulatedController::new(behaviour);
    let handle = sim.handle();
    let mut driver = GrblDriver::new(config);
    driver.attach(sim.settings(), Box::new(sim)).unwrap();
    (driver, handle)
}

// =============================================================================
// Wait-for-completion
// =============================================================================

#[test]
fn test_immediate_idle_completes_within_one_poll() {
    let config = GrblConfig {
        settle_delay_ms: 0,
        ..GrblConfig::default()
    };
    let poll = config.poll_interval();
    let (mut driver, handle) = driver_with(config, IdleBehaviour::ImmediateIdle);

    let start = Instant::now();
    let outcome = driver
        .move_absolute(AxisValues::xy(10.0, 5.0), 7000.0)
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(outcome, MotionOutcome::Idle);
    assert_eq!(handle.status_requests(), 1);
    assert!(elapsed < poll * 2, "took {:?}", elapsed);
    assert_eq!(driver.position(), MachinePosition { x: 10.0, y: 5.0 });
}

#[test]
#[serial]
fn test_never_idle_times_out_with_default_deadline() {
    let config = GrblConfig {
        settle_delay_ms: 0,
        ..GrblConfig::default()
    };
    let (mut driver, handle) = driver_with(config, IdleBehaviour::NeverIdle);

    let start = Instant::now();
    let err = driver
        .move_absolute(AxisValues::xy(10.0, 5.0), 7000.0)
        .unwrap_err();

    assert!(start.elapsed() >= Duration::from_secs(5));
    match err {
        GantryError::Timeout { last_status, .. } => {
            assert!(last_status.unwrap_or_default().starts_with("<Run"));
        }
        other => panic!("expected timeout, got {other}"),
    }
    assert_eq!(driver.position(), MachinePosition::default());
    // Every iteration re-issued the status request.
    assert!(handle.status_requests() >= 20);
}

#[test]
fn test_idle_after_several_polls() {
    let (mut driver, handle) = driver_with(fast_config(), IdleBehaviour::IdleAfterPolls(3));
    let outcome = driver.move_absolute(AxisValues::x(42.0), 1000.0).unwrap();
    assert!(outcome.is_idle());
    assert_eq!(handle.status_requests(), 4);
    assert_eq!(driver.position().x, 42.0);
}

#[test]
#[traced_test]
fn test_alarm_is_distinct_outcome_and_keeps_position() {
    let (mut driver, handle) = driver_with(fast_config(), IdleBehaviour::ImmediateIdle);
    driver.move_absolute(AxisValues::xy(1.0, 1.0), 1000.0).unwrap();

    handle.set_behaviour(IdleBehaviour::Alarm);
    let outcome = driver.move_absolute(AxisValues::xy(9.0, 9.0), 1000.0).unwrap();

    assert_eq!(outcome, MotionOutcome::Alarm("ALARM:1".to_string()));
    assert_eq!(driver.position(), MachinePosition { x: 1.0, y: 1.0 });
    assert!(logs_contain("Controller reported alarm"));
}

#[test]
fn test_unsolicited_alarm_ends_the_wait() {
    // Controller keeps reporting Run, but a limit switch trips mid-move.
    let (mut driver, handle) = driver_with(fast_config(), IdleBehaviour::NeverIdle);
    handle.inject("ALARM:2");

    let outcome = driver.move_absolute(AxisValues::y(30.0), 1000.0).unwrap();

    assert_eq!(outcome, MotionOutcome::Alarm("ALARM:2".to_string()));
    assert_eq!(handle.status_requests(), 1);
    assert_eq!(driver.position(), MachinePosition::default());
}

// =============================================================================
// Position bookkeeping
// =============================================================================

#[test]
fn test_relative_moves_accumulate_in_any_order() {
    let mut rng = StdRng::seed_from_u64(0x6a17);
    // Quarter-millimetre steps keep every partial sum exact in f64.
    let mut deltas: Vec<(f64, f64)> = (0..12)
        .map(|_| {
            (
                rng.gen_range(-40i32..=40) as f64 * 0.25,
                rng.gen_range(-40i32..=40) as f64 * 0.25,
            )
        })
        .collect();
    let expected_x: f64 = deltas.iter().map(|d| d.0).sum();
    let expected_y: f64 = deltas.iter().map(|d| d.1).sum();

    for _ in 0..2 {
        deltas.shuffle(&mut rng);
        let (mut driver, handle) = driver_with(fast_config(), IdleBehaviour::ImmediateIdle);
        driver.home().unwrap();
        for &(dx, dy) in &deltas {
            driver
                .move_relative(AxisValues::xy(dx, dy), 2000.0)
                .unwrap();
        }
        assert_eq!(
            driver.position(),
            MachinePosition {
                x: expected_x,
                y: expected_y
            }
        );
        assert_eq!(handle.machine_position(), (expected_x, expected_y));
        assert!(!handle.is_relative());
    }
}

#[test]
fn test_relative_move_wire_sequence() {
    let (mut driver, handle) = driver_with(fast_config(), IdleBehaviour::ImmediateIdle);
    driver.move_relative(AxisValues::y(2.5), 7000.0).unwrap();
    assert_eq!(
        handle.received_lines(),
        vec!["G21", "G91", "G1 Y2.5 F7000", "G4 P0", "G90"]
    );
}

#[test]
fn test_failed_relative_move_restores_absolute_mode() {
    let (mut driver, handle) = driver_with(fast_config(), IdleBehaviour::NeverIdle);
    let err = driver
        .move_relative(AxisValues::x(5.0), 7000.0)
        .unwrap_err();
    assert!(matches!(err, GantryError::Timeout { .. }));
    assert_eq!(handle.received_lines().last().map(String::as_str), Some("G90"));
    assert!(!handle.is_relative());
    assert_eq!(driver.position(), MachinePosition::default());
}

#[test]
fn test_zero_moves_axis_home_and_keeps_other() {
    let (mut driver, _) = driver_with(fast_config(), IdleBehaviour::ImmediateIdle);
    driver.move_absolute(AxisValues::xy(12.0, -3.0), 7000.0).unwrap();
    driver.zero(Axis::Y).unwrap();
    assert_eq!(driver.position(), MachinePosition { x: 12.0, y: 0.0 });
}

// =============================================================================
// Soft limits
// =============================================================================

#[test]
fn test_out_of_range_target_is_never_transmitted() {
    let (mut driver, handle) = driver_with(fast_config(), IdleBehaviour::ImmediateIdle);
    let err = driver
        .move_absolute(AxisValues::xy(1500.0, 0.0), 7000.0)
        .unwrap_err();
    assert!(matches!(err, GantryError::Range { axis: Axis::X, .. }));
    assert!(handle.received_lines().is_empty());
    assert_eq!(handle.status_requests(), 0);
}

#[test]
fn test_relative_move_checks_resulting_target() {
    let (mut driver, handle) = driver_with(fast_config(), IdleBehaviour::ImmediateIdle);
    driver.move_absolute(AxisValues::y(990.0), 7000.0).unwrap();
    let sent = handle.received_lines().len();

    let err = driver.move_relative(AxisValues::y(20.0), 7000.0).unwrap_err();
    assert!(matches!(err, GantryError::Range { axis: Axis::Y, .. }));
    assert_eq!(handle.received_lines().len(), sent);
}

#[test]
fn test_non_finite_target_is_rejected_even_when_advisory() {
    let config = GrblConfig {
        enforce_soft_limits: false,
        ..fast_config()
    };
    let (mut driver, handle) = driver_with(config, IdleBehaviour::ImmediateIdle);

    let err = driver.move_absolute(AxisValues::x(f64::NAN), 7000.0).unwrap_err();
    assert!(matches!(err, GantryError::Range { axis: Axis::X, .. }));
    let err = driver
        .move_relative(AxisValues::y(f64::INFINITY), 7000.0)
        .unwrap_err();
    assert!(matches!(err, GantryError::Range { axis: Axis::Y, .. }));

    assert!(handle.received_lines().is_empty());
    assert_eq!(driver.position(), MachinePosition::default());
}

#[test]
fn test_bad_feed_rate_is_never_transmitted() {
    let (mut driver, handle) = driver_with(fast_config(), IdleBehaviour::ImmediateIdle);
    for feed in [-5.0, 0.0, f64::NAN] {
        let err = driver.move_absolute(AxisValues::x(1.0), feed).unwrap_err();
        assert!(matches!(err, GantryError::Configuration(_)), "feed {feed}");
        let err = driver.move_relative(AxisValues::x(1.0), feed).unwrap_err();
        assert!(matches!(err, GantryError::Configuration(_)), "feed {feed}");
    }
    assert!(handle.received_lines().is_empty());
    assert_eq!(driver.position(), MachinePosition::default());
}

#[test]
fn test_limits_can_be_advisory() {
    let config = GrblConfig {
        enforce_soft_limits: false,
        ..fast_config()
    };
    let (mut driver, _) = driver_with(config, IdleBehaviour::ImmediateIdle);
    assert!(driver
        .move_absolute(AxisValues::x(1500.0), 7000.0)
        .unwrap()
        .is_idle());
}

// =============================================================================
// Sessions
// =============================================================================

#[test]
fn test_session_start_and_teardown_order() -> anyhow::Result<()> {
    let (mut driver, handle) = driver_with(fast_config(), IdleBehaviour::ImmediateIdle);

    let position = driver.run_session(|d| {
        d.move_absolute(AxisValues::xy(10.0, 5.0), 7000.0)?;
        Ok(d.position())
    })?;

    assert_eq!(position, MachinePosition { x: 10.0, y: 5.0 });
    assert_eq!(
        handle.received_lines(),
        vec![
            "$H",
            "$RST=#",
            "G10 P0 L20 X0 Y0",
            "G21",
            "G90",
            "G1 X10 Y5 F7000",
            "G4 P0",
            "$H",
            "$H",
        ]
    );
    assert_eq!(driver.connection_state(), ConnectionState::Closed);
    assert_eq!(driver.position(), MachinePosition::default());
    Ok(())
}

#[test]
fn test_session_body_error_still_tears_down() {
    let (mut driver, handle) = driver_with(fast_config(), IdleBehaviour::NeverIdle);

    let result: AppResult<()> = driver.run_session(|d| {
        d.move_absolute(AxisValues::x(3.0), 7000.0)?;
        Ok(())
    });

    assert!(matches!(result, Err(GantryError::Timeout { .. })));
    assert_eq!(driver.connection_state(), ConnectionState::Closed);
    let lines = handle.received_lines();
    assert_eq!(&lines[lines.len() - 2..], &["$H", "$H"]);
}

#[test]
fn test_dropped_guard_tears_down() {
    let (mut driver, handle) = driver_with(fast_config(), IdleBehaviour::ImmediateIdle);
    {
        let mut session = driver.arm().unwrap();
        session.move_absolute(AxisValues::x(1.0), 7000.0).unwrap();
    }
    assert_eq!(driver.connection_state(), ConnectionState::Closed);
    assert_eq!(handle.received_lines().last().map(String::as_str), Some("$H"));
}

#[test]
fn test_panicking_body_still_tears_down() {
    let (mut driver, handle) = driver_with(fast_config(), IdleBehaviour::ImmediateIdle);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let _: AppResult<()> = driver.run_session(|_| panic!("operator pulled the plug"));
    }));
    assert!(outcome.is_err());
    assert_eq!(driver.connection_state(), ConnectionState::Closed);
    let lines = handle.received_lines();
    assert_eq!(&lines[lines.len() - 2..], &["$H", "$H"]);
}

#[test]
fn test_arm_on_missing_port_is_connection_error() {
    let mut driver = GrblDriver::new(GrblConfig {
        port: "/dev/gantry-missing-port".into(),
        ..fast_config()
    });
    let err = driver.arm().err().unwrap();
    assert!(matches!(err, GantryError::Connection(_)));
    assert_eq!(driver.connection_state(), ConnectionState::Closed);
}

/// Port that accepts reads but fails every write, like a cable pulled mid-session.
struct BrokenWrites;

impl Read for BrokenWrites {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

impl Write for BrokenWrites {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "cable unplugged"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "cable unplugged"))
    }
}

impl SerialPortIO for BrokenWrites {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(0)
    }
}

#[test]
fn test_failed_start_sequence_tears_down_and_closes() {
    let mut driver = GrblDriver::new(fast_config());
    driver
        .attach(
            LinkSettings::new("broken://grbl", 115_200, Duration::from_secs(2)),
            Box::new(BrokenWrites),
        )
        .unwrap();

    match driver.arm() {
        Err(GantryError::SessionFailed { phase, errors }) => {
            assert_eq!(phase, SessionPhase::Start);
            assert!(!errors.is_empty());
            assert!(errors.iter().all(|e| matches!(e, GantryError::Io(_))));
        }
        Err(other) => panic!("expected start failure, got {other}"),
        Ok(_) => panic!("armed over a broken link"),
    }
    assert_eq!(driver.connection_state(), ConnectionState::Closed);
}

#[test]
fn test_teardown_failures_are_aggregated() {
    let (mut driver, _) = driver_with(fast_config(), IdleBehaviour::ImmediateIdle);
    let session = driver.arm().unwrap();
    let result = {
        let mut session = session;
        // Closing early makes both homing commands fail during teardown.
        session.close().unwrap();
        session.finish()
    };
    match result {
        Err(GantryError::SessionFailed { phase, errors }) => {
            assert_eq!(phase, SessionPhase::Teardown);
            assert_eq!(errors.len(), 2);
            assert!(errors
                .iter()
                .all(|e| matches!(e, GantryError::NotConnected)));
        }
        other => panic!("expected teardown failure, got {other:?}"),
    }
}
