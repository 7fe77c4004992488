//! Hardware backends that do not need a physical device.

pub mod mock;
