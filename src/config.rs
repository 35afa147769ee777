//! Camera configuration using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults ([`CameraConfig::default`])
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `INDICAM_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! INDICAM_DEVICE__NAME="ZWO CCD ASI120MM"
//! INDICAM_SEQUENCE__FINISH_POLL_MS=50
//! INDICAM_LOGGING__LEVEL=debug
//! ```
//!
//! # Example
//!
//! ```no_run
//! use indi_camera::config::CameraConfig;
//!
//! let config = CameraConfig::load(Some("camera.toml"))?;
//! println!("Device: {}", config.device.name);
//! # Ok::<(), indi_camera::error::CameraError>(())
//! ```

use crate::error::{AppResult, CameraError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "INDICAM_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Target device and connection policy
    pub device: DeviceConfig,
    /// Exposure state machine settings
    pub exposure: ExposureConfig,
    /// Sequence worker timing
    pub sequence: SequenceConfig,
    /// Log output
    pub logging: LoggingConfig,
}

/// Device connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device name as announced by the server
    pub name: String,
    /// Transport session connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Extra session connect attempts after the first failure
    pub max_retries: u32,
}

/// Exposure settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    /// How long `Downloading` may last without an attachment, in milliseconds
    pub download_grace_ms: u64,
}

/// Sequence worker timing, all in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Bound on waiting for a frame to start.
    pub start_timeout_ms: u64,
    /// Poll period while waiting for a frame to start.
    pub start_poll_ms: u64,
    /// Poll period while waiting for a frame to finish.
    pub finish_poll_ms: u64,
    /// Wait for the attachment after the exposure ended.
    pub frame_grace_ms: u64,
    /// Granularity of abortable sleeps between frames.
    pub interval_chunk_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level (trace, debug, info, warn, error); `RUST_LOG` wins if set
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "CCD Simulator".to_string(),
            connect_timeout_ms: 5000,
            max_retries: 3,
        }
    }
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            download_grace_ms: 5000,
        }
    }
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: 5000,
            start_poll_ms: 10,
            finish_poll_ms: 100,
            frame_grace_ms: 500,
            interval_chunk_ms: 100,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl CameraConfig {
    /// Build the figment with every provider layered in.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(CameraConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate configuration.
    ///
    /// A missing TOML file is not an error; its layer is simply empty.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref().map(|p| -> &Path { p.as_ref() })).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the camera cannot work with.
    pub fn validate(&self) -> AppResult<()> {
        if self.device.name.trim().is_empty() {
            return Err(CameraError::InvalidArgument("device.name cannot be empty".into()));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(CameraError::InvalidArgument(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let s = &self.sequence;
        for (key, value) in [
            ("start_poll_ms", s.start_poll_ms),
            ("finish_poll_ms", s.finish_poll_ms),
            ("interval_chunk_ms", s.interval_chunk_ms),
        ] {
            if value == 0 {
                return Err(CameraError::InvalidArgument(format!(
                    "sequence.{key} must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    /// Per-attempt connection timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.device.connect_timeout_ms)
    }

    /// Wait for an attachment after the exposure ended.
    pub fn download_grace(&self) -> Duration {
        Duration::from_millis(self.exposure.download_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let config = CameraConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.device.name, "CCD Simulator");
        assert_eq!(config.sequence.frame_grace_ms, 500);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_toml_then_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "camera.toml",
                r#"
                [device]
                name = "ZWO CCD ASI120MM"
                max_retries = 1

                [sequence]
                finish_poll_ms = 50
                "#,
            )?;
            jail.set_env("INDICAM_SEQUENCE__FINISH_POLL_MS", "20");
            jail.set_env("INDICAM_LOGGING__JSON", "true");

            let config = CameraConfig::load(Some("camera.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.device.name, "ZWO CCD ASI120MM");
            assert_eq!(config.device.max_retries, 1);
            assert_eq!(config.device.connect_timeout_ms, 5000);
            assert_eq!(config.sequence.finish_poll_ms, 20);
            assert!(config.logging.json);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let config = CameraConfig::load(Some("absent.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config, CameraConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_zero_poll() {
        let mut config = CameraConfig::default();
        config.sequence.interval_chunk_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(CameraError::InvalidArgument(_))
        ));

        let mut config = CameraConfig::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_value_is_config_error() {
        Jail::expect_with(|jail| {
            jail.set_env("INDICAM_DEVICE__MAX_RETRIES", "many");
            let err = CameraConfig::load(None::<&str>).unwrap_err();
            assert_eq!(err.kind(), "config");
            Ok(())
        });
    }
}
