//! Static descriptions of the child devices a controller drives.
//!
//! Each model knows its base units and default output limits. User limits from
//! the configuration replace the defaults.

use crate::error::{AppResult, DeviceError};
use serde::{Deserialize, Serialize};

/// Allowed output range, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// Lowest allowed value.
    pub min: f64,
    /// Highest allowed value.
    pub max: f64,
}

impl Limits {
    /// Limits spanning `[min, max]`.
    pub fn new(min: f64, max: f64) -> AppResult<Self> {
        if min.is_nan() || max.is_nan() || min > max {
            return Err(DeviceError::Configuration(format!(
                "Invalid limits ({}, {})",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// No restriction.
    pub const fn unbounded() -> Self {
        Self {
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
        }
    }

    /// Reject `value` if it falls outside the limits.
    pub fn check(&self, connection: &str, value: f64) -> AppResult<()> {
        if value.is_nan() || value < self.min || value > self.max {
            return Err(DeviceError::Validation(format!(
                "Value {} for '{}' is outside the limits [{}, {}]",
                value, connection, self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Known child device models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildModel {
    /// Any Elliptec module, positions in raw counts.
    #[default]
    ElliptecDevice,
    /// ELL14 rotation mount.
    Ell14,
    /// Any brushed DC servo motor on a KDC101.
    BrushedDcServoMotor,
    /// Z812 motorized actuator.
    Z812,
    /// Any actuator in an actuator group.
    Actuator,
    /// KDC101-driven actuator, positions in counts.
    Kdc101Actuator,
}

impl ChildModel {
    /// Human-readable model description.
    pub fn description(&self) -> &'static str {
        match self {
            ChildModel::ElliptecDevice => "Generic Elliptec Device",
            ChildModel::Ell14 => "ELL14 Rotation Mount",
            ChildModel::BrushedDcServoMotor | ChildModel::Actuator => "Generic Actuator",
            ChildModel::Z812 => "Z812 Brushed DC Servo Motor",
            ChildModel::Kdc101Actuator => "KDC101 Servo Motor Controller",
        }
    }

    /// Unit of the values exchanged with the worker.
    pub fn base_units(&self) -> &'static str {
        match self {
            ChildModel::ElliptecDevice | ChildModel::Ell14 => "counts",
            ChildModel::BrushedDcServoMotor | ChildModel::Z812 => "mm",
            ChildModel::Actuator | ChildModel::Kdc101Actuator => "counts",
        }
    }

    /// Limits applied when the configuration gives none.
    ///
    /// The ELL14 accepts one revolution, 0 to 360 degrees, expressed here in
    /// encoder counts.
    pub fn default_limits(&self) -> Limits {
        match self {
            ChildModel::ElliptecDevice => Limits::unbounded(),
            ChildModel::Ell14 => Limits {
                min: 0.0,
                max: crate::devices::elliptec::units::ELL14_COUNTS_PER_REVOLUTION,
            },
            ChildModel::BrushedDcServoMotor | ChildModel::Actuator => Limits {
                min: 0.0,
                max: f64::INFINITY,
            },
            ChildModel::Z812 => Limits { min: 0.0, max: 12.0 },
            ChildModel::Kdc101Actuator => Limits {
                min: 0.0,
                max: 76_346.0,
            },
        }
    }

    /// Models that may sit on an Elliptec bus.
    pub fn is_elliptec(&self) -> bool {
        matches!(self, ChildModel::ElliptecDevice | ChildModel::Ell14)
    }

    /// Models that a single KDC101 can drive.
    pub fn is_servo(&self) -> bool {
        matches!(self, ChildModel::BrushedDcServoMotor | ChildModel::Z812)
    }

    /// Models allowed in an actuator group.
    pub fn is_actuator(&self) -> bool {
        matches!(self, ChildModel::Actuator | ChildModel::Kdc101Actuator)
    }
}

/// Resolve configured limits against the model defaults.
pub fn resolve_limits(model: ChildModel, configured: Option<[f64; 2]>) -> AppResult<Limits> {
    match configured {
        Some([min, max]) => Limits::new(min, max),
        None => Ok(model.default_limits()),
    }
}
