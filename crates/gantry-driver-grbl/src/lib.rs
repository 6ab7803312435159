//! GRBL motion controller driver for the gantry workstation.
//!
//! # Modules
//!
//! - [`protocol`]: G-code command rendering and status line classification
//! - [`config`]: serde-backed driver configuration with defaults
//! - [`driver`]: [`GrblDriver`], the blocking command/wait state machine
//! - [`session`]: armed sessions with guaranteed teardown
//! - [`simulator`]: in-memory controller implementing the serial transport
//!
//! # Example
//!
//! ```rust,ignore
//! use gantry_driver_grbl::{AxisValues, GrblConfig, GrblDriver, MotionOutcome};
//!
//! let mut driver = GrblDriver::new(GrblConfig::default());
//! driver.open_configured()?;
//! match driver.move_absolute(AxisValues::xy(10.0, 5.0), 7000.0)? {
//!     MotionOutcome::Idle => println!("at {}", driver.position()),
//!     MotionOutcome::Alarm(line) => eprintln!("alarm: {line}"),
//! }
//! driver.close()?;
//! ```

pub mod config;
pub mod driver;
pub mod protocol;
pub mod session;
pub mod simulator;

pub use config::GrblConfig;
pub use driver::{
    AxisValues, ConnectionState, GrblDriver, LinkSettings, MachinePosition, MotionOutcome,
};
pub use protocol::{ControllerStatus, GcodeCommand};
pub use session::ArmedSession;
pub use simulator::{IdleBehaviour, SimulatedController, SimulatorHandle};
