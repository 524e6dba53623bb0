//! Configuration system for the rig.
//!
//! Strongly-typed settings loaded with Figment from (in order of
//! precedence):
//! 1. Environment variables prefixed with `HYGRO_`
//! 2. A TOML configuration file (default: `config/default.toml`)
//!
//! # Example
//!
//! ```no_run
//! use hygrostat::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("tick period: {:?}", settings.scheduler.tick_period);
//! # Ok::<(), hygrostat::error::RigError>(())
//! ```
//!
//! Any value can be overridden through the environment with the key path
//! separated by double underscores:
//!
//! ```text
//! HYGRO_APPLICATION__LOG_LEVEL=debug
//! HYGRO_SCHEDULER__TICK_PERIOD=250ms
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RigError, RigResult};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application-level settings
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Polling loop settings
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    /// Closed-loop humidity control settings
    #[serde(default)]
    pub control: ControlSettings,
    /// Recording / storage settings
    #[serde(default)]
    pub storage: StorageSettings,
    /// Device definitions, fixed at startup
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name used in log lines
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Polling loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Fixed tick period; observed rigs run between 50 ms and 500 ms.
    #[serde(with = "humantime_serde", default = "default_tick_period")]
    pub tick_period: Duration,
    /// Capacity of each device's sliding-window ring buffer
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Length of the per-device display window
    #[serde(default = "default_display_window")]
    pub display_window: usize,
}

/// Closed-loop control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSettings {
    /// Key of the tracked humidity probe
    #[serde(default = "default_sensor_key")]
    pub sensor: String,
    /// Key of the dry-line flow controller
    #[serde(default = "default_dry_key")]
    pub dry_flow: String,
    /// Key of the wet-line flow controller
    #[serde(default = "default_wet_key")]
    pub wet_flow: String,
    /// Total flow split across the two lines [sccm]
    #[serde(default = "default_total_flow")]
    pub total_flow: f64,
    /// Proportional gain
    #[serde(default = "default_kp")]
    pub kp: f64,
    /// Integral gain
    #[serde(default = "default_ki")]
    pub ki: f64,
    /// Derivative gain
    #[serde(default)]
    pub kd: f64,
}

/// Recording configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory for per-device recording files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

/// Supported device kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Synthetic sine/cosine source, always connects
    Simulated,
    /// Mass flow controller (actuator + multi-field sample)
    FlowController,
    /// Humidity/temperature probe on the shared sensor bus
    HumidityProbe,
    /// RS-232 pressure transducer
    PressureSensor,
}

/// One `[[devices]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Stable device key, e.g. "MFC1", "SHT1", "PS1"
    pub key: String,
    /// Device kind
    pub kind: DeviceKind,
    /// Oscillation frequency for simulated devices [Hz]
    #[serde(default = "default_sim_freq")]
    pub frequency: f64,
}

impl Settings {
    /// Loads settings from the default location plus `HYGRO_` overrides.
    pub fn load() -> RigResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads settings from a specific TOML file plus `HYGRO_` overrides.
    ///
    /// A missing file is not an error: defaults apply, and the environment
    /// can still override them.
    pub fn load_from<P: AsRef<Path>>(path: P) -> RigResult<Self> {
        let settings: Settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("HYGRO_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation beyond what parsing enforces.
    pub fn validate(&self) -> RigResult<()> {
        if self.scheduler.tick_period.is_zero() {
            return Err(RigError::Configuration(
                "scheduler.tick_period must be positive".to_string(),
            ));
        }
        if self.scheduler.buffer_capacity == 0 {
            return Err(RigError::Configuration(
                "scheduler.buffer_capacity must be positive".to_string(),
            ));
        }
        if self.scheduler.display_window == 0 {
            return Err(RigError::Configuration(
                "scheduler.display_window must be positive".to_string(),
            ));
        }
        if !self.control.total_flow.is_finite() || self.control.total_flow <= 0.0 {
            return Err(RigError::Configuration(
                "control.total_flow must be a positive number".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for dev in &self.devices {
            if dev.key.is_empty() {
                return Err(RigError::Configuration(
                    "device key must not be empty".to_string(),
                ));
            }
            if !seen.insert(dev.key.as_str()) {
                return Err(RigError::Configuration(format!(
                    "duplicate device key '{}'",
                    dev.key
                )));
            }
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationSettings::default(),
            scheduler: SchedulerSettings::default(),
            control: ControlSettings::default(),
            storage: StorageSettings::default(),
            devices: Vec::new(),
        }
    }
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_period: default_tick_period(),
            buffer_capacity: default_buffer_capacity(),
            display_window: default_display_window(),
        }
    }
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            sensor: default_sensor_key(),
            dry_flow: default_dry_key(),
            wet_flow: default_wet_key(),
            total_flow: default_total_flow(),
            kp: default_kp(),
            ki: default_ki(),
            kd: 0.0,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

fn default_app_name() -> String {
    "hygrostat".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_period() -> Duration {
    Duration::from_millis(100)
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_display_window() -> usize {
    10
}

fn default_sensor_key() -> String {
    "SHT1".to_string()
}

fn default_dry_key() -> String {
    "MFC1".to_string()
}

fn default_wet_key() -> String {
    "MFC2".to_string()
}

fn default_total_flow() -> f64 {
    100.0
}

fn default_kp() -> f64 {
    5.7585
}

fn default_ki() -> f64 {
    15.9046
}

fn default_sim_freq() -> f64 {
    1.0
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.scheduler.tick_period, Duration::from_millis(100));
        assert_eq!(settings.scheduler.buffer_capacity, 10_000);
        assert_eq!(settings.scheduler.display_window, 10);
    }

    #[test]
    fn test_parse_toml_fragment() {
        let settings: Settings = Figment::new()
            .merge(Toml::string(
                r#"
                [scheduler]
                tick_period = "250ms"
                display_window = 50

                [[devices]]
                key = "MFC1"
                kind = "flow_controller"

                [[devices]]
                key = "SHT1"
                kind = "humidity_probe"
                "#,
            ))
            .extract()
            .unwrap();

        assert_eq!(settings.scheduler.tick_period, Duration::from_millis(250));
        assert_eq!(settings.scheduler.display_window, 50);
        assert_eq!(settings.devices.len(), 2);
        assert_eq!(settings.devices[0].kind, DeviceKind::FlowController);
    }

    #[test]
    fn test_duplicate_device_key_rejected() {
        let mut settings = Settings::default();
        for _ in 0..2 {
            settings.devices.push(DeviceDefinition {
                key: "MFC1".to_string(),
                kind: DeviceKind::FlowController,
                frequency: 1.0,
            });
        }
        assert!(matches!(
            settings.validate(),
            Err(RigError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_tick_period_rejected() {
        let mut settings = Settings::default();
        settings.scheduler.tick_period = Duration::ZERO;
        assert!(settings.validate().is_err());
    }
}
