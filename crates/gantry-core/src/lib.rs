//! `gantry-core`
//!
//! Shared building blocks for the gantry workstation drivers.
//!
//! The motion driver (`gantry-driver-grbl`) and the frame source
//! (`gantry-camera`) share no runtime state. They do share vocabulary:
//!
//! - [`error::GantryError`]: the single error taxonomy surfaced to callers
//! - [`serial`]: blocking serial transport abstraction and helpers
//! - [`data::Frame`]: 8-bit, 3-channel interleaved image buffer
//! - [`limits`]: soft travel limits and protocol timing constants

pub mod data;
pub mod error;
pub mod limits;
pub mod serial;

pub use data::{Frame, Resolution};
pub use error::{AppResult, GantryError, SessionPhase};
