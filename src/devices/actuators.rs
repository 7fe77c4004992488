//! Group of KDC101-driven actuators, one controller per actuator.
//!
//! Connections are named `device N`. Values are encoder counts; they are
//! rounded to whole counts before being sent. A move is considered done once
//! the position counter reads exactly the target.

use crate::adapters::Transport;
use crate::config::{ActuatorConfig, ActuatorsConfig};
use crate::devices::apt::{to_counts, AptController};
use crate::devices::models::{resolve_limits, Limits};
use crate::error::{AppResult, DeviceError};
use crate::error_recovery::RetryPolicy;
use crate::shot::ShotFile;
use crate::worker::{ChannelValue, ChannelValues, DeviceWorker};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Device number of a `device N` connection.
pub fn device_number(connection: &str) -> AppResult<u32> {
    let mut parts = connection.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(prefix), Some(number), None) if prefix.eq_ignore_ascii_case("device") => {
            number.parse::<u32>().map_err(|_| {
                DeviceError::Validation(format!("Invalid device number in '{}'", connection))
            })
        }
        _ => Err(DeviceError::Validation(format!(
            "Actuator connection '{}' is not of the form 'device N'",
            connection
        ))),
    }
}

struct Actuator {
    connection: String,
    number: u32,
    serial_number: Option<String>,
    limits: Limits,
    transport: Option<Box<dyn Transport>>,
    controller: Option<AptController>,
}

impl Actuator {
    fn new(cfg: &ActuatorConfig, transport: Box<dyn Transport>) -> AppResult<Self> {
        Ok(Self {
            connection: cfg.connection.clone(),
            number: device_number(&cfg.connection)?,
            serial_number: cfg.serial_number.clone(),
            limits: resolve_limits(cfg.model, cfg.limits)?,
            transport: Some(transport),
            controller: None,
        })
    }

    fn controller(&mut self) -> AppResult<&mut AptController> {
        self.controller.as_mut().ok_or(DeviceError::NotConnected)
    }
}

/// Worker for an actuator group.
pub struct ActuatorsWorker {
    name: String,
    actuators: Vec<Actuator>,
    move_timeout: Duration,
    poll_interval: Duration,
    retry: RetryPolicy,
}

impl ActuatorsWorker {
    /// Worker with one transport per configured actuator, in order.
    pub fn new(
        name: impl Into<String>,
        config: &ActuatorsConfig,
        transports: Vec<Box<dyn Transport>>,
        retry: RetryPolicy,
    ) -> AppResult<Self> {
        let name = name.into();
        if transports.len() != config.actuators.len() {
            return Err(DeviceError::Configuration(format!(
                "{}: {} actuators configured but {} transports given",
                name,
                config.actuators.len(),
                transports.len()
            )));
        }
        let actuators = config
            .actuators
            .iter()
            .zip(transports)
            .map(|(cfg, transport)| Actuator::new(cfg, transport))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self {
            name,
            actuators,
            move_timeout: Duration::from_millis(config.move_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            retry,
        })
    }

    fn index_of(&self, connection: &str) -> AppResult<usize> {
        let number = device_number(connection)?;
        self.actuators
            .iter()
            .position(|a| a.number == number)
            .ok_or_else(|| {
                DeviceError::Validation(format!(
                    "{} has no actuator at connection '{}'",
                    self.name, connection
                ))
            })
    }

    /// Move one actuator and poll until it reports the target.
    #[instrument(skip(self), fields(device = %self.name))]
    pub async fn move_actuator(&mut self, index: usize, target: i32) -> AppResult<()> {
        let (move_timeout, poll_interval) = (self.move_timeout, self.poll_interval);
        let actuator = self.actuators.get_mut(index).ok_or_else(|| {
            DeviceError::Validation(format!("No actuator with index {}", index))
        })?;
        let number = actuator.number;
        let controller = actuator.controller()?;
        controller.start_move_absolute(target).await?;

        let deadline = Instant::now() + move_timeout;
        loop {
            let position = controller.position().await?;
            if position == target {
                debug!(number, position, "Actuator reached target");
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(DeviceError::Timeout(format!(
                    "Device {} did not move to requested position {} within timeout (at {})",
                    number, target, position
                )));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Move every connection in `values`, then read all positions back.
    pub async fn move_to(&mut self, values: &ChannelValues) -> AppResult<ChannelValues> {
        let mut targets = Vec::with_capacity(values.len());
        for (connection, value) in values {
            let index = self.index_of(connection)?;
            let value = value.as_analog(connection)?;
            self.actuators[index].limits.check(connection, value)?;
            targets.push((index, to_counts(value)?));
        }
        for (index, counts) in targets {
            self.move_actuator(index, counts).await?;
        }
        self.check_remote_values().await
    }
}

#[async_trait]
impl DeviceWorker for ActuatorsWorker {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(device = %self.name))]
    async fn init(&mut self) -> AppResult<()> {
        for actuator in &mut self.actuators {
            let transport = actuator.transport.take().ok_or_else(|| {
                DeviceError::Configuration(format!("{} is already initialised", actuator.connection))
            })?;
            let mut controller = AptController::connect(transport, REPLY_TIMEOUT, &self.retry).await?;
            controller.enable_channel().await?;
            if let Some(expected) = &actuator.serial_number {
                let actual = controller.hardware_info().await?.serial_number.to_string();
                if &actual != expected {
                    return Err(DeviceError::SerialNumberMismatch {
                        connection: actuator.connection.clone(),
                        actual,
                        expected: expected.clone(),
                    });
                }
            }
            actuator.controller = Some(controller);
        }
        info!(actuators = self.actuators.len(), "Actuators ready");
        Ok(())
    }

    async fn program_manual(&mut self, values: &ChannelValues) -> AppResult<ChannelValues> {
        self.move_to(values).await
    }

    async fn check_remote_values(&mut self) -> AppResult<ChannelValues> {
        let mut remote = ChannelValues::new();
        for actuator in &mut self.actuators {
            let position = actuator.controller()?.position().await?;
            remote.insert(actuator.connection.clone(), ChannelValue::Analog(f64::from(position)));
        }
        Ok(remote)
    }

    async fn transition_to_buffered(
        &mut self,
        device_name: &str,
        shot: Arc<dyn ShotFile>,
        _initial_values: &ChannelValues,
        _fresh: bool,
    ) -> AppResult<ChannelValues> {
        let values: ChannelValues = shot
            .static_values(device_name)?
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, ChannelValue::Analog(v)))
            .collect();
        self.move_to(&values).await
    }

    async fn transition_to_manual(&mut self) -> AppResult<bool> {
        Ok(true)
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        let mut errors = Vec::new();
        for actuator in &mut self.actuators {
            if let Some(mut controller) = actuator.controller.take() {
                if let Err(e) = controller.close().await {
                    errors.push(e);
                }
            }
        }
        crate::error_recovery::collect_shutdown_errors(errors)
    }
}
