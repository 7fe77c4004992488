//! Device drivers and their workers.

pub mod actuators;
pub mod agilent_83650b;
pub mod apt;
pub mod elliptec;
pub mod kdc101;
pub mod models;
pub mod pco;
