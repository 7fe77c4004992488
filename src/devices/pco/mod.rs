//! PCO camera support.
//!
//! Layers, bottom up:
//!
//! - [`sdk`]: the blocking SDK calls, as traits
//! - [`camera`]: buffer ring, attributes, ROI and flips
//! - [`worker`]: the host-facing worker with buffered and continuous modes
//!
//! A buffered shot moves the camera through
//! `Idle -> Configured -> Recording -> Draining -> Stopped`: attributes are
//! applied and armed, recording starts, one buffer per exposure is queued,
//! and a blocking thread waits for the last buffer before copying every
//! frame out. `transition_to_manual` joins that thread, stops recording and
//! writes the frames to the shot file grouped by exposure.

pub mod attributes;
pub mod camera;
pub mod error;
pub mod frame;
pub mod sdk;
pub mod worker;

pub use attributes::{AttributeValue, Roi};
pub use camera::{AbortHandle, AcquisitionState, PcoCamera};
pub use error::PcoError;
pub use frame::Frame;
pub use sdk::{PcoCameraSdk, PcoLibrary};
pub use worker::PcoCameraWorker;
