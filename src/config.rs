//! Configuration using Figment
//!
//! Settings are loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `LABDEV_`, nested keys separated by
//!    a double underscore
//!
//! ```text
//! LABDEV_APPLICATION__LOG_LEVEL=debug
//! LABDEV_APPLICATION__CONNECTION_ATTEMPTS=3
//! ```
//!
//! Each entry of `devices` names one worker. Its `type` selects which of the
//! per-type tables under `config` must be present:
//!
//! ```toml
//! [application]
//! name = "Lab"
//! log_level = "info"
//!
//! [[devices]]
//! name = "rotators"
//! type = "elliptec"
//! mock = true
//!
//! [devices.config.elliptec]
//! com_port = "COM3"
//! axes = [{ connection = "0", model = "ell14", serial_number = "12345678" }]
//! ```

use crate::devices::models::{resolve_limits, ChildModel};
use crate::error::{AppResult, DeviceError};
use crate::error_recovery::RetryPolicy;
use crate::shot::CameraAttributes;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Device definitions
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
    /// Attempts made when opening a device connection
    #[serde(default = "default_connection_attempts")]
    pub connection_attempts: u32,
    /// Pause between connection attempts in milliseconds
    #[serde(default = "default_connection_backoff")]
    pub connection_backoff_ms: u64,
}

impl ApplicationConfig {
    /// Retry policy for opening device connections.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.connection_attempts,
            backoff_delay: Duration::from_millis(self.connection_backoff_ms),
        }
    }
}

/// Kind of worker a device definition creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Elliptec interface board
    Elliptec,
    /// Agilent 83650B synthesizer behind a Prologix GPIB adapter
    #[serde(rename = "agilent_83650b")]
    Agilent83650b,
    /// Single KDC101 servo controller
    Kdc101,
    /// Group of KDC101-driven actuators
    Actuators,
    /// PCO camera
    PcoCamera,
}

impl DeviceType {
    /// Key of the matching table under `config`.
    pub fn config_key(&self) -> &'static str {
        match self {
            DeviceType::Elliptec => "elliptec",
            DeviceType::Agilent83650b => "agilent_83650b",
            DeviceType::Kdc101 => "kdc101",
            DeviceType::Actuators => "actuators",
            DeviceType::PcoCamera => "pco_camera",
        }
    }
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device name, as in the connection table
    pub name: String,
    /// Worker type
    pub r#type: DeviceType,
    /// Use a simulated device instead of hardware
    #[serde(default)]
    pub mock: bool,
    /// Type-specific configuration
    #[serde(default)]
    pub config: DeviceSpecificConfig,
}

/// Type-specific configuration tables. Exactly the one matching the device
/// type is read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSpecificConfig {
    /// Elliptec configuration
    #[serde(default)]
    pub elliptec: Option<ElliptecConfig>,
    /// Agilent 83650B configuration
    #[serde(default)]
    pub agilent_83650b: Option<Agilent83650bConfig>,
    /// KDC101 configuration
    #[serde(default)]
    pub kdc101: Option<Kdc101Config>,
    /// Actuator group configuration
    #[serde(default)]
    pub actuators: Option<ActuatorsConfig>,
    /// PCO camera configuration
    #[serde(default)]
    pub pco_camera: Option<PcoCameraConfig>,
}

/// Elliptec interface board configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElliptecConfig {
    /// Serial port of the interface board (e.g., "COM3", "/dev/ttyUSB0")
    pub com_port: String,
    /// Baud rate
    #[serde(default = "default_elliptec_baud_rate")]
    pub baud_rate: u32,
    /// Reply timeout in milliseconds
    #[serde(default = "default_elliptec_timeout")]
    pub timeout_ms: u64,
    /// Modules on the bus
    #[serde(default)]
    pub axes: Vec<ElliptecAxisConfig>,
}

/// One module on an Elliptec bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElliptecAxisConfig {
    /// Bus address as a single hex digit
    pub connection: String,
    /// Module model
    #[serde(default)]
    pub model: ChildModel,
    /// Expected serial number, checked at startup
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Home the module when the worker starts
    #[serde(default)]
    pub home_on_startup: bool,
    /// Output limits in counts, replacing the model defaults
    #[serde(default)]
    pub limits: Option<[f64; 2]>,
    /// Units of the channel values
    #[serde(default)]
    pub units: ElliptecUnits,
}

/// Units an Elliptec axis exchanges values in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElliptecUnits {
    /// Raw encoder counts
    #[default]
    Counts,
    /// Degrees, ELL14 only
    Deg,
}

/// Agilent 83650B configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agilent83650bConfig {
    /// Serial port of the Prologix USB-GPIB adapter
    pub com_port: String,
    /// GPIB address of the synthesizer
    pub gpib_address: u8,
    /// Baud rate of the adapter's virtual serial port
    #[serde(default = "default_prologix_baud_rate")]
    pub baud_rate: u32,
    /// Read timeout in milliseconds
    #[serde(default = "default_gpib_timeout")]
    pub timeout_ms: u64,
    /// Sweep between frequencies instead of jumping. Not supported.
    #[serde(default)]
    pub ramp_between_frequencies: bool,
}

/// KDC101 configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kdc101Config {
    /// Serial port of the K-Cube
    pub port: String,
    /// Serial number printed on the K-Cube
    pub serial_number: String,
    /// Baud rate
    #[serde(default = "default_apt_baud_rate")]
    pub baud_rate: u32,
    /// Home the stage at startup if it is not homed
    #[serde(default)]
    pub allow_homing: bool,
    /// Encoder counts per mm
    #[serde(default = "default_counts_per_unit")]
    pub counts_per_unit: f64,
    /// Connection name of the stage
    #[serde(default = "default_kdc101_connection")]
    pub connection: String,
    /// Stage model
    #[serde(default = "default_kdc101_model")]
    pub model: ChildModel,
    /// Output limits in mm, replacing the model defaults
    #[serde(default)]
    pub limits: Option<[f64; 2]>,
    /// Timeout for homing and moves in milliseconds
    #[serde(default = "default_motion_timeout")]
    pub motion_timeout_ms: u64,
}

/// Actuator group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorsConfig {
    /// Actuators in the group
    #[serde(default)]
    pub actuators: Vec<ActuatorConfig>,
    /// Time allowed for a move to reach its target, in milliseconds
    #[serde(default = "default_motion_timeout")]
    pub move_timeout_ms: u64,
    /// Interval between position polls while moving, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// One actuator of a group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorConfig {
    /// Connection name, `device N`
    pub connection: String,
    /// Serial port of this actuator's controller
    pub port: String,
    /// Baud rate
    #[serde(default = "default_apt_baud_rate")]
    pub baud_rate: u32,
    /// Expected serial number, checked at startup
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Actuator model
    #[serde(default = "default_actuator_model")]
    pub model: ChildModel,
    /// Output limits in counts, replacing the model defaults
    #[serde(default)]
    pub limits: Option<[f64; 2]>,
}

/// PCO camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcoCameraConfig {
    /// Camera serial number
    pub serial_number: u32,
    /// Image group name in the shot file; defaults to the device name
    #[serde(default)]
    pub orientation: Option<String>,
    /// Attributes for buffered shots, used when the shot file has none
    #[serde(default)]
    pub camera_attributes: CameraAttributes,
    /// Attributes restored between shots
    #[serde(default)]
    pub manual_mode_camera_attributes: CameraAttributes,
    /// Time to wait for a shot's images after the shot ends, in seconds
    #[serde(default = "default_stop_acquisition_timeout")]
    pub stop_acquisition_timeout_secs: f64,
    /// Fail the shot when images are missing
    #[serde(default = "default_exception_on_failed_shot")]
    pub exception_on_failed_shot: bool,
    /// Timeout of a single frame wait, in milliseconds
    #[serde(default = "default_grab_timeout")]
    pub grab_timeout_ms: u64,
    /// Interval between abort checks during a shot, in milliseconds
    #[serde(default = "default_abort_check_period")]
    pub abort_check_period_ms: u64,
    /// Sensor of the simulated camera used when `mock` is set
    #[serde(default)]
    pub mock_sensor: Option<MockSensorConfig>,
}

/// Geometry of a simulated camera sensor
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MockSensorConfig {
    /// Full-frame width in pixels
    pub width: u16,
    /// Full-frame height in pixels
    pub height: u16,
    /// Bit depth
    #[serde(default = "default_mock_bit_depth")]
    pub bit_depth: u16,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_connection_attempts() -> u32 {
    10
}

fn default_connection_backoff() -> u64 {
    1000
}

fn default_elliptec_baud_rate() -> u32 {
    9600
}

fn default_elliptec_timeout() -> u64 {
    30_000
}

fn default_prologix_baud_rate() -> u32 {
    115_200
}

fn default_gpib_timeout() -> u64 {
    2000
}

fn default_apt_baud_rate() -> u32 {
    115_200
}

fn default_counts_per_unit() -> f64 {
    34_304.0
}

fn default_kdc101_connection() -> String {
    "position".to_string()
}

fn default_kdc101_model() -> ChildModel {
    ChildModel::Z812
}

fn default_actuator_model() -> ChildModel {
    ChildModel::Kdc101Actuator
}

fn default_motion_timeout() -> u64 {
    60_000
}

fn default_poll_interval() -> u64 {
    100
}

fn default_stop_acquisition_timeout() -> f64 {
    5.0
}

fn default_exception_on_failed_shot() -> bool {
    true
}

fn default_grab_timeout() -> u64 {
    1000
}

fn default_abort_check_period() -> u64 {
    1000
}

fn default_mock_bit_depth() -> u16 {
    14
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load settings from `path` with `LABDEV_` environment overrides, then
    /// validate them.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABDEV_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from TOML text without environment overrides.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let settings: Self = Figment::new().merge(Toml::string(text)).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Find a device definition by name.
    pub fn device(&self, name: &str) -> AppResult<&DeviceDefinition> {
        self.devices
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| DeviceError::Configuration(format!("No device named '{}'", name)))
    }

    /// Check semantic constraints:
    /// - log level is valid
    /// - device names are unique
    /// - every device has the configuration table its type needs
    /// - child connections, models and limits are consistent
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DeviceError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(&device.name) {
                return Err(DeviceError::Configuration(format!(
                    "Duplicate device name: '{}'",
                    device.name
                )));
            }
            device.validate()?;
        }
        Ok(())
    }
}

impl DeviceDefinition {
    fn missing(&self) -> DeviceError {
        DeviceError::Configuration(format!(
            "Device '{}' of type {:?} is missing its 'config.{}' table",
            self.name,
            self.r#type,
            self.r#type.config_key()
        ))
    }

    /// Elliptec table, required for `type = "elliptec"`.
    pub fn elliptec(&self) -> AppResult<&ElliptecConfig> {
        self.config.elliptec.as_ref().ok_or_else(|| self.missing())
    }

    /// Agilent table, required for `type = "agilent_83650b"`.
    pub fn agilent_83650b(&self) -> AppResult<&Agilent83650bConfig> {
        self.config
            .agilent_83650b
            .as_ref()
            .ok_or_else(|| self.missing())
    }

    /// KDC101 table, required for `type = "kdc101"`.
    pub fn kdc101(&self) -> AppResult<&Kdc101Config> {
        self.config.kdc101.as_ref().ok_or_else(|| self.missing())
    }

    /// Actuator group table, required for `type = "actuators"`.
    pub fn actuators(&self) -> AppResult<&ActuatorsConfig> {
        self.config.actuators.as_ref().ok_or_else(|| self.missing())
    }

    /// PCO table, required for `type = "pco_camera"`.
    pub fn pco_camera(&self) -> AppResult<&PcoCameraConfig> {
        self.config.pco_camera.as_ref().ok_or_else(|| self.missing())
    }

    fn validate(&self) -> AppResult<()> {
        match self.r#type {
            DeviceType::Elliptec => {
                let cfg = self.elliptec()?;
                let mut seen = HashSet::new();
                for axis in &cfg.axes {
                    let address = crate::devices::elliptec::codec::parse_address(&axis.connection)
                        .map_err(|e| DeviceError::Configuration(format!("{}: {}", self.name, e)))?;
                    if !seen.insert(address) {
                        return Err(DeviceError::Configuration(format!(
                            "{}: duplicate Elliptec connection '{}'",
                            self.name, axis.connection
                        )));
                    }
                    self.check_model(axis.model.is_elliptec(), axis.model, &axis.connection)?;
                    resolve_limits(axis.model, axis.limits)?;
                    if axis.units == ElliptecUnits::Deg && axis.model != ChildModel::Ell14 {
                        return Err(DeviceError::Configuration(format!(
                            "{}: connection '{}' uses degrees, which only the ELL14 supports",
                            self.name, axis.connection
                        )));
                    }
                }
            }
            DeviceType::Agilent83650b => {
                let cfg = self.agilent_83650b()?;
                if cfg.gpib_address > 30 {
                    return Err(DeviceError::Configuration(format!(
                        "{}: GPIB address {} is outside 0-30",
                        self.name, cfg.gpib_address
                    )));
                }
            }
            DeviceType::Kdc101 => {
                let cfg = self.kdc101()?;
                if cfg.counts_per_unit <= 0.0 {
                    return Err(DeviceError::Configuration(format!(
                        "{}: counts_per_unit must be positive",
                        self.name
                    )));
                }
                self.check_model(cfg.model.is_servo(), cfg.model, &cfg.connection)?;
                resolve_limits(cfg.model, cfg.limits)?;
            }
            DeviceType::Actuators => {
                let cfg = self.actuators()?;
                let mut seen = HashSet::new();
                for actuator in &cfg.actuators {
                    let number = crate::devices::actuators::device_number(&actuator.connection)
                        .map_err(|e| DeviceError::Configuration(format!("{}: {}", self.name, e)))?;
                    if !seen.insert(number) {
                        return Err(DeviceError::Configuration(format!(
                            "{}: duplicate actuator connection '{}'",
                            self.name, actuator.connection
                        )));
                    }
                    self.check_model(actuator.model.is_actuator(), actuator.model, &actuator.connection)?;
                    resolve_limits(actuator.model, actuator.limits)?;
                }
            }
            DeviceType::PcoCamera => {
                let cfg = self.pco_camera()?;
                if !(cfg.stop_acquisition_timeout_secs >= 0.0) {
                    return Err(DeviceError::Configuration(format!(
                        "{}: stop_acquisition_timeout_secs must be non-negative",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_model(&self, allowed: bool, model: ChildModel, connection: &str) -> AppResult<()> {
        if allowed {
            Ok(())
        } else {
            Err(DeviceError::Configuration(format!(
                "{}: model {:?} at '{}' cannot be driven by a {:?} device",
                self.name, model, connection, self.r#type
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
[application]
name = "Lab"
log_level = "info"
"#;

    #[test]
    fn test_minimal_settings() {
        let settings = Settings::from_toml_str(BASE).unwrap();
        assert!(settings.devices.is_empty());
        assert_eq!(settings.application.retry_policy(), RetryPolicy::connection());
    }

    #[test]
    fn test_invalid_log_level() {
        let text = BASE.replace("info", "loud");
        assert!(matches!(
            Settings::from_toml_str(&text),
            Err(DeviceError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_type_table() {
        let text = format!(
            "{}\n[[devices]]\nname = \"synth\"\ntype = \"agilent_83650b\"\n",
            BASE
        );
        let err = Settings::from_toml_str(&text).unwrap_err();
        assert!(err.to_string().contains("config.agilent_83650b"));
    }

    #[test]
    fn test_elliptec_model_mismatch() {
        let text = format!(
            r#"{}
[[devices]]
name = "rotators"
type = "elliptec"

[devices.config.elliptec]
com_port = "COM3"
axes = [{{ connection = "0", model = "z812" }}]
"#,
            BASE
        );
        assert!(Settings::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_defaults_filled_in() {
        let text = format!(
            r#"{}
[[devices]]
name = "stage"
type = "kdc101"
mock = true

[devices.config.kdc101]
port = "/dev/ttyUSB1"
serial_number = "27000001"
"#,
            BASE
        );
        let settings = Settings::from_toml_str(&text).unwrap();
        let cfg = settings.device("stage").unwrap().kdc101().unwrap();
        assert_eq!(cfg.counts_per_unit, 34_304.0);
        assert_eq!(cfg.model, ChildModel::Z812);
        assert_eq!(cfg.connection, "position");
        assert!(!cfg.allow_homing);
        assert!(settings.device("nobody").is_err());
    }

    #[test]
    fn test_printed_settings_reload() {
        let text = format!(
            r#"{}
[[devices]]
name = "synth"
type = "agilent_83650b"
mock = true

[devices.config.agilent_83650b]
com_port = "COM4"
gpib_address = 19
"#,
            BASE
        );
        let settings = Settings::from_toml_str(&text).unwrap();
        let printed = toml::to_string_pretty(&settings).unwrap();
        let reloaded = Settings::from_toml_str(&printed).unwrap();
        let cfg = reloaded.device("synth").unwrap().agilent_83650b().unwrap();
        assert_eq!(cfg.gpib_address, 19);
        assert_eq!(cfg.timeout_ms, 2000);
    }

    #[test]
    fn test_degrees_need_ell14() {
        let text = format!(
            r#"{}
[[devices]]
name = "rotators"
type = "elliptec"

[devices.config.elliptec]
com_port = "COM3"
axes = [{{ connection = "0", model = "ell14", units = "deg" }}]
"#,
            BASE
        );
        let settings = Settings::from_toml_str(&text).unwrap();
        let axis = &settings.device("rotators").unwrap().elliptec().unwrap().axes[0];
        assert_eq!(axis.units, ElliptecUnits::Deg);

        let generic = text.replace("ell14", "elliptec_device");
        let err = Settings::from_toml_str(&generic).unwrap_err();
        assert!(err.to_string().contains("only the ELL14"));
    }
}
