//! Worker construction from device definitions.
//!
//! The choice between hardware and simulation is made here, once, from the
//! `mock` flag of each definition. Workers only ever see a `Transport` or a
//! `PcoLibrary` trait object.

use crate::adapters::serial_adapter::SerialAdapter;
use crate::adapters::Transport;
use crate::config::{DeviceDefinition, DeviceType, MockSensorConfig, Settings};
use crate::devices::actuators::ActuatorsWorker;
use crate::devices::agilent_83650b::Agilent83650BWorker;
use crate::devices::elliptec::codec::parse_address;
use crate::devices::elliptec::ElliptecWorker;
use crate::devices::kdc101::Kdc101Worker;
use crate::devices::pco::sdk::PcoLibrary;
use crate::devices::pco::PcoCameraWorker;
use crate::error::{AppResult, DeviceError};
use crate::error_recovery::RetryPolicy;
use crate::hardware::mock::{
    SimulatedElliptecBus, SimulatedKCube, SimulatedPcoCamera, SimulatedPcoLibrary,
    SimulatedSynthesizer, SimulatedTransport,
};
use crate::worker::DeviceWorker;
use tracing::info;

const DEFAULT_MOCK_SENSOR: MockSensorConfig = MockSensorConfig {
    width: 640,
    height: 480,
    bit_depth: 14,
};

/// Build the worker for `definition`.
pub fn build_worker(
    definition: &DeviceDefinition,
    retry: &RetryPolicy,
) -> AppResult<Box<dyn DeviceWorker>> {
    let name = definition.name.as_str();
    let retry = retry.clone();
    info!(device = name, kind = ?definition.r#type, mock = definition.mock, "Building worker");

    let worker: Box<dyn DeviceWorker> = match definition.r#type {
        DeviceType::Elliptec => {
            let config = definition.elliptec()?;
            let transport: Box<dyn Transport> = if definition.mock {
                let addresses = config
                    .axes
                    .iter()
                    .map(|axis| parse_address(&axis.connection))
                    .collect::<AppResult<Vec<_>>>()?;
                let mut bus = SimulatedElliptecBus::with_addresses(addresses.iter().copied());
                for (axis, address) in config.axes.iter().zip(addresses) {
                    if let (Some(serial), Some(module)) =
                        (&axis.serial_number, bus.module_mut(address))
                    {
                        module.serial_number = serial.clone();
                    }
                }
                Box::new(SimulatedTransport::new(name, bus))
            } else {
                Box::new(SerialAdapter::new(&config.com_port, config.baud_rate))
            };
            Box::new(ElliptecWorker::new(name, config, transport, retry)?)
        }
        DeviceType::Agilent83650b => {
            let config = definition.agilent_83650b()?;
            let transport: Box<dyn Transport> = if definition.mock {
                Box::new(SimulatedTransport::new(
                    name,
                    SimulatedSynthesizer::new(config.gpib_address),
                ))
            } else {
                Box::new(SerialAdapter::new(&config.com_port, config.baud_rate))
            };
            Box::new(Agilent83650BWorker::new(name, config, transport, retry))
        }
        DeviceType::Kdc101 => {
            let config = definition.kdc101()?;
            let transport: Box<dyn Transport> = if definition.mock {
                let serial = mock_serial_number(name, &config.serial_number)?;
                Box::new(SimulatedTransport::new(name, SimulatedKCube::new(serial)))
            } else {
                Box::new(SerialAdapter::new(&config.port, config.baud_rate))
            };
            Box::new(Kdc101Worker::new(name, config, transport, retry)?)
        }
        DeviceType::Actuators => {
            let config = definition.actuators()?;
            let transports = config
                .actuators
                .iter()
                .map(|actuator| -> AppResult<Box<dyn Transport>> {
                    if definition.mock {
                        let serial = match actuator.serial_number.as_deref() {
                            Some(text) => mock_serial_number(name, text)?,
                            None => 0,
                        };
                        let mut cube = SimulatedKCube::new(serial);
                        cube.homed = true;
                        Ok(Box::new(SimulatedTransport::new(
                            format!("{} {}", name, actuator.connection),
                            cube,
                        )))
                    } else {
                        Ok(Box::new(SerialAdapter::new(&actuator.port, actuator.baud_rate)))
                    }
                })
                .collect::<AppResult<Vec<_>>>()?;
            Box::new(ActuatorsWorker::new(name, config, transports, retry)?)
        }
        DeviceType::PcoCamera => Box::new(build_camera_worker(definition)?),
    };
    Ok(worker)
}

/// K-Cube serial numbers are numeric; the simulator needs one up front.
fn mock_serial_number(device: &str, text: &str) -> AppResult<u32> {
    text.trim().parse().map_err(|_| {
        DeviceError::Configuration(format!(
            "{}: serial number '{}' is not numeric",
            device, text
        ))
    })
}

/// Build the camera worker for a `pco_camera` definition.
pub fn build_camera_worker(definition: &DeviceDefinition) -> AppResult<PcoCameraWorker> {
    let config = definition.pco_camera()?;
    if !definition.mock {
        return Err(DeviceError::FeatureIncomplete(
            "pco_sdk".to_string(),
            "No PCO SDK binding is built in; set mock = true to use the simulated camera"
                .to_string(),
        ));
    }
    let sensor = config.mock_sensor.unwrap_or(DEFAULT_MOCK_SENSOR);
    let camera = SimulatedPcoCamera::new(
        config.serial_number,
        sensor.width,
        sensor.height,
        sensor.bit_depth,
    );
    let library: Box<dyn PcoLibrary> = Box::new(SimulatedPcoLibrary::new(vec![camera]));
    Ok(PcoCameraWorker::new(&definition.name, config, library))
}

/// Build every configured worker, in definition order.
pub fn build_all(settings: &Settings) -> AppResult<Vec<Box<dyn DeviceWorker>>> {
    let retry = settings.application.retry_policy();
    settings
        .devices
        .iter()
        .map(|definition| build_worker(definition, &retry))
        .collect()
}
