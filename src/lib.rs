//! Device workers for BLACS-style experiment control.
//!
//! Each supported device gets a worker implementing [`worker::DeviceWorker`]:
//!
//! - Thorlabs Elliptec interface boards and ELL14 rotation mounts
//! - Agilent 83650B synthesizers behind a Prologix GPIB-USB adapter
//! - Thorlabs KDC101 servo controllers, singly or as an actuator group
//! - PCO cameras, in buffered and continuous acquisition modes
//!
//! Serial devices talk through the [`adapters::Transport`] trait; cameras
//! through the [`devices::pco::sdk`] traits. [`registry`] picks real or
//! simulated backends from configuration.

pub mod adapters;
pub mod config;
pub mod devices;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod logging;
pub mod registry;
pub mod shot;
pub mod worker;

pub use error::{AppResult, DeviceError};
pub use worker::{ChannelValue, ChannelValues, DeviceWorker};
