//! Configuration System using Figment
//!
//! Configuration is layered, later sources winning:
//! 1. Built-in defaults
//! 2. `config/bluefly.toml` (or the file given to [`FlyConfig::load_from`]),
//!    if it exists
//! 3. Environment variables prefixed with `BLUEFLY_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated with a double underscore:
//!
//! ```text
//! BLUEFLY_APPLICATION__LOG_LEVEL=debug
//! BLUEFLY_SCAN__TRAJECTORY_BATCH_SIZE=50
//! BLUEFLY_STORAGE__DATA_DIR=/dls/tmp/scans
//! ```
//!
//! # Example
//!
//! ```no_run
//! use bluefly::config::FlyConfig;
//!
//! let config = FlyConfig::load()?;
//! println!("Batch size: {}", config.scan.trajectory_batch_size);
//! # Ok::<(), bluefly::error::FlyError>(())
//! ```

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{FlyError, FlyResult};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/bluefly.toml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlyConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Fly scan timing
    pub scan: ScanConfig,
    /// Area detector timing and frame size
    pub detector: DetectorSettings,
    /// Simulated hardware behaviour
    pub sim: SimConfig,
    /// Where detector files go
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty or json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "bluefly".into(),
            log_level: "info".into(),
            log_format: "pretty".into(),
        }
    }
}

/// Fly scan configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Points written to the motion controller per build or append
    pub trajectory_batch_size: usize,
    /// How long past its expected time to wait for a detector frame
    pub collect_timeout_secs: f64,
    /// Time between progress reports of a step scan detector
    pub progress_interval_secs: f64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            trajectory_batch_size: 100,
            collect_timeout_secs: 60.0,
            progress_interval_secs: 0.1,
        }
    }
}

/// Area detector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    /// Time to read a frame out after exposure
    pub readout_time_secs: f64,
    /// Accuracy of the trigger clock, parts per million
    pub frequency_accuracy_ppm: f64,
    /// Time between HDF flushes while collecting
    pub flush_interval_secs: f64,
    /// Simulated frame width in pixels
    pub width: usize,
    /// Simulated frame height in pixels
    pub height: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            readout_time_secs: 0.02,
            frequency_accuracy_ppm: 50.0,
            flush_interval_secs: 1.0,
            width: 320,
            height: 240,
        }
    }
}

/// Simulated motor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Velocity in units per second
    pub motor_velocity: f64,
    /// Display precision
    pub motor_precision: u32,
    /// Engineering units
    pub motor_units: String,
    /// Time between readback updates during a move
    pub motor_update_interval_secs: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            motor_velocity: 1.0,
            motor_precision: 3,
            motor_units: "mm".into(),
            motor_update_interval_secs: 0.1,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for generated file prefixes, the system temp dir if unset
    pub data_dir: Option<PathBuf>,
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl FlyConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    ///
    /// # Errors
    ///
    /// Returns [`FlyError::Config`] if a source cannot be parsed or the
    /// result fails [`FlyConfig::validate`].
    pub fn load() -> FlyResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file, which need not exist, and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> FlyResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        tracing::debug!(path = %path.as_ref().display(), "Loaded configuration");
        Ok(config)
    }

    /// The layered sources, for callers wanting to add their own on top.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("BLUEFLY_").split("__"))
    }

    /// Check values make sense together.
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Log format is pretty or json
    /// - Batch size is non-zero
    /// - Timings are positive
    /// - Detector frames have non-zero size
    pub fn validate(&self) -> FlyResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(FlyError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(FlyError::Config(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.scan.trajectory_batch_size == 0 {
            return Err(FlyError::Config(
                "trajectory_batch_size must be > 0".to_string(),
            ));
        }

        let timings = [
            ("scan.collect_timeout_secs", self.scan.collect_timeout_secs),
            ("scan.progress_interval_secs", self.scan.progress_interval_secs),
            ("detector.flush_interval_secs", self.detector.flush_interval_secs),
            ("sim.motor_velocity", self.sim.motor_velocity),
            (
                "sim.motor_update_interval_secs",
                self.sim.motor_update_interval_secs,
            ),
        ];
        for (name, value) in timings {
            if value.is_nan() || value <= 0.0 {
                return Err(FlyError::Config(format!("{name} must be > 0, got {value}")));
            }
        }
        for (name, value) in [
            ("detector.readout_time_secs", self.detector.readout_time_secs),
            (
                "detector.frequency_accuracy_ppm",
                self.detector.frequency_accuracy_ppm,
            ),
        ] {
            if value.is_nan() || value < 0.0 {
                return Err(FlyError::Config(format!(
                    "{name} must not be negative, got {value}"
                )));
            }
        }

        if self.detector.width == 0 || self.detector.height == 0 {
            return Err(FlyError::Config(format!(
                "Detector frame must have non-zero size, got {}x{}",
                self.detector.width, self.detector.height
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let config = FlyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scan.trajectory_batch_size, 100);
        assert_eq!(config.detector.width, 320);
        assert_eq!(config.storage.data_dir, None);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = FlyConfig::default();
        config.application.log_level = "chatty".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_zero_batch_size() {
        let mut config = FlyConfig::default();
        config.scan.trajectory_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_timings() {
        let mut config = FlyConfig::default();
        config.scan.collect_timeout_secs = 0.0;
        assert!(config.validate().is_err());

        let mut config = FlyConfig::default();
        config.detector.readout_time_secs = -0.1;
        assert!(config.validate().is_err());

        let mut config = FlyConfig::default();
        config.detector.height = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("non-zero size"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        Jail::expect_with(|jail| {
            let config = FlyConfig::load_from(jail.directory().join("absent.toml"))
                .map_err(|e| e.to_string())?;
            assert_eq!(config, FlyConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_file_then_env_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bluefly.toml",
                r#"
                [application]
                log_level = "debug"

                [scan]
                trajectory_batch_size = 20

                [storage]
                data_dir = "/data/scans"
                "#,
            )?;
            jail.set_env("BLUEFLY_SCAN__TRAJECTORY_BATCH_SIZE", "50");
            jail.set_env("BLUEFLY_DETECTOR__WIDTH", "64");

            let config = FlyConfig::load_from("bluefly.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.application.log_level, "debug");
            assert_eq!(config.scan.trajectory_batch_size, 50);
            assert_eq!(config.detector.width, 64);
            assert_eq!(config.detector.height, 240);
            assert_eq!(config.storage.data_dir, Some(PathBuf::from("/data/scans")));
            Ok(())
        });
    }

    #[test]
    fn test_invalid_file_value_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("bluefly.toml", "[application]\nlog_format = \"xml\"\n")?;
            let err = FlyConfig::load_from("bluefly.toml").unwrap_err();
            assert!(err.to_string().contains("Invalid log_format"));
            Ok(())
        });
    }
}
