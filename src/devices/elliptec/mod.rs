//! Thorlabs Elliptec interface board and rotation mounts.
//!
//! Up to sixteen motors share one half-duplex serial bus; each is addressed by
//! a single hex digit. The worker in this module owns the bus connection and
//! maps connection names (`"0"`..`"F"`) to bus addresses.

pub mod codec;
pub mod interface;
pub mod units;
pub mod worker;

pub use interface::ElliptecInterface;
pub use units::Ell14UnitConverter;
pub use worker::ElliptecWorker;

use std::fmt;
use thiserror::Error;

/// Status code reported by an Elliptec module in a `GS` reply.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElliptecError {
    /// Raw status code.
    pub code: u32,
}

impl fmt::Display for ElliptecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {}: {}", self.code, describe_status(self.code))
    }
}

impl ElliptecError {
    /// Wrap a status code.
    pub fn new(code: u32) -> Self {
        Self { code }
    }
}

/// Human-readable message for a status code.
pub fn describe_status(code: u32) -> &'static str {
    match code {
        0 => "No error.",
        1 => "Communication time out.",
        2 => "Mechanical time out.",
        3 => "Command error or not supported.",
        4 => "Value out of range.",
        5 => "Module isolated.",
        6 => "Module out of isolation.",
        7 => "Initializing error.",
        8 => "Thermal error.",
        9 => "Busy.",
        10 => "Sensor Error (May appear during self test. If code persists there is an error).",
        11 => "Motor Error (May appear during self test. If code persists there is an error).",
        12 => "Out of Range (e.g. stage has been instructed to move beyond its travel range).",
        13 => "Over Current error.",
        _ => "Undefined Error.",
    }
}
