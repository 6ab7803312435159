//! Layered configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/gantry.toml` (or the file given with `--config`)
//! 2. Environment variables prefixed with `GANTRY_`, nested keys joined by `__`
//!
//! Every section has defaults, so a missing file yields a usable config.
//!
//! # Example
//! ```no_run
//! use gantry_vision::config::GantryConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // GANTRY_MOTION__PORT=/dev/ttyACM0 overrides motion.port
//! let config = GantryConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok(())
//! # }
//! ```

use crate::logging::{parse_log_level, OutputFormat};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use gantry_camera::CameraConfig;
use gantry_core::{AppResult, GantryError};
use gantry_driver_grbl::GrblConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/gantry.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "GANTRY_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GantryConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// GRBL motion controller
    pub motion: GrblConfig,
    /// Camera and calibration
    pub camera: CameraConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Gantry Vision".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

impl GantryConfig {
    /// Load from `config/gantry.toml` and the environment
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(|e| GantryError::Configuration(e.to_string()))
    }

    /// The provider stack: defaults, then the file, then `GANTRY_*` variables.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(GantryConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Semantic checks the deserializer can't express
    pub fn validate(&self) -> AppResult<()> {
        parse_log_level(&self.application.log_level)?;
        self.motion.validate()?;
        self.camera.validate()?;
        Ok(())
    }
}
