//! # Gantry Vision
//!
//! Application shell for a two-axis camera gantry: a GRBL motion controller
//! carries a high-resolution camera over a sample.
//!
//! The hardware drivers live in their own crates and are re-exported here:
//!
//! - [`gantry_driver_grbl`]: motion control over a serial link
//! - [`gantry_camera`]: background frame capture and fisheye undistortion
//! - [`gantry_core`]: errors, frames and limits shared by both
//!
//! This crate adds:
//!
//! - **`config`**: layered TOML + environment configuration (`figment`)
//! - **`logging`**: the `tracing` subscriber the binary installs
//! - **`station`**: opening real or simulated hardware from configuration

pub mod config;
pub mod logging;
pub mod station;

pub use gantry_camera;
pub use gantry_core;
pub use gantry_driver_grbl;

pub use config::GantryConfig;
pub use station::Backend;
