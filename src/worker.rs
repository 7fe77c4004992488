//! The worker contract the experiment-control host calls on every device.
//!
//! A worker owns exactly one device connection between `init` and `shutdown`
//! and runs one command at a time. The host drives it through two modes:
//!
//! - **manual**: front-panel values are pushed with `program_manual` and read
//!   back with `check_remote_values`.
//! - **buffered**: `transition_to_buffered` reads the shot's static value table
//!   and arms the device; `transition_to_manual` collects results once the shot
//!   has run. `abort_buffered` cancels a shot in progress.

use crate::error::{AppResult, DeviceError};
use crate::shot::ShotFile;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Frequency, amplitude and gate of a DDS-like output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DdsValues {
    /// Frequency in Hz.
    pub freq: f64,
    /// Amplitude in dBm.
    pub amp: f64,
    /// Output enabled.
    pub gate: bool,
}

/// Value of one output channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelValue {
    /// On/off output.
    Digital(bool),
    /// Position or level in base units.
    Analog(f64),
    /// Grouped synthesizer output.
    Dds(DdsValues),
}

impl ChannelValue {
    /// Numeric value, rejecting digital and DDS channels.
    pub fn as_analog(&self, connection: &str) -> AppResult<f64> {
        match self {
            ChannelValue::Analog(v) => Ok(*v),
            other => Err(DeviceError::Validation(format!(
                "Expected a number for '{}', got {}",
                connection, other
            ))),
        }
    }

    /// DDS triple, rejecting scalar channels.
    pub fn as_dds(&self, connection: &str) -> AppResult<DdsValues> {
        match self {
            ChannelValue::Dds(v) => Ok(*v),
            other => Err(DeviceError::Validation(format!(
                "Expected freq/amp/gate for '{}', got {}",
                connection, other
            ))),
        }
    }
}

impl fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelValue::Digital(v) => write!(f, "{}", v),
            ChannelValue::Analog(v) => write!(f, "{}", v),
            ChannelValue::Dds(v) => write!(f, "freq={} Hz amp={} dBm gate={}", v.freq, v.amp, v.gate),
        }
    }
}

/// Connection name to value.
pub type ChannelValues = BTreeMap<String, ChannelValue>;

/// Whether a smart-programmed setter has to touch the hardware.
pub fn needs_write<T: PartialEq>(fresh: bool, last_set: Option<&T>, new: &T) -> bool {
    fresh || last_set != Some(new)
}

/// Device-side half of the host framework.
#[async_trait]
pub trait DeviceWorker: Send {
    /// Device name from the connection table.
    fn name(&self) -> &str;

    /// Open the connection and bring the device to a known state.
    async fn init(&mut self) -> AppResult<()>;

    /// Apply front-panel values and return what the device reports back.
    async fn program_manual(&mut self, values: &ChannelValues) -> AppResult<ChannelValues>;

    /// Read the current device values.
    async fn check_remote_values(&mut self) -> AppResult<ChannelValues>;

    /// Load the shot's static values and arm the device.
    ///
    /// Returns the values the front panel should show during the shot.
    async fn transition_to_buffered(
        &mut self,
        device_name: &str,
        shot: Arc<dyn ShotFile>,
        initial_values: &ChannelValues,
        fresh: bool,
    ) -> AppResult<ChannelValues>;

    /// Finish a shot. Returns `true` on success.
    async fn transition_to_manual(&mut self) -> AppResult<bool>;

    /// Cancel a shot in progress.
    async fn abort_buffered(&mut self) -> AppResult<bool> {
        self.transition_to_manual().await
    }

    /// Cancel a `transition_to_buffered` that failed half way.
    async fn abort_transition_to_buffered(&mut self) -> AppResult<bool> {
        self.abort_buffered().await
    }

    /// Close the device connection.
    async fn shutdown(&mut self) -> AppResult<()>;
}
