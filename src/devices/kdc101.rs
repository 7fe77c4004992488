//! KDC101 K-Cube brushed DC servo controller driving a single stage.
//!
//! The worker exposes one connection (by default `position`) in real units,
//! millimetres for the Z812 stage. The controller itself works in encoder
//! counts; `counts_per_unit` converts between the two.

use crate::adapters::Transport;
use crate::config::Kdc101Config;
use crate::devices::apt::{to_counts, AptController};
use crate::devices::models::{resolve_limits, Limits};
use crate::error::{AppResult, DeviceError};
use crate::error_recovery::RetryPolicy;
use crate::shot::ShotFile;
use crate::worker::{ChannelValue, ChannelValues, DeviceWorker};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Reply timeout for status and position requests.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Single-axis servo controller in real units.
#[async_trait]
pub trait ServoController: Send {
    /// Serial number printed on the controller.
    async fn serial_number(&mut self) -> AppResult<String>;

    /// Whether the stage has been homed since power-up.
    async fn is_homed(&mut self) -> AppResult<bool>;

    /// Home the stage and wait for completion.
    async fn home(&mut self) -> AppResult<()>;

    /// Move to `position` and wait for completion.
    async fn move_to(&mut self, position: f64) -> AppResult<()>;

    /// Current position.
    async fn position(&mut self) -> AppResult<f64>;

    /// Release the controller.
    async fn close(&mut self) -> AppResult<()>;
}

/// `ServoController` over the APT protocol.
pub struct AptServo {
    controller: AptController,
    counts_per_unit: f64,
    motion_timeout: Duration,
}

impl AptServo {
    /// Connect, enable the motor channel and start status updates.
    pub async fn connect(
        transport: Box<dyn Transport>,
        config: &Kdc101Config,
        policy: &RetryPolicy,
    ) -> AppResult<Self> {
        let mut controller = AptController::connect(transport, REPLY_TIMEOUT, policy).await?;
        controller.enable_channel().await?;
        controller.start_update_messages().await?;
        Ok(Self {
            controller,
            counts_per_unit: config.counts_per_unit,
            motion_timeout: Duration::from_millis(config.motion_timeout_ms),
        })
    }
}

#[async_trait]
impl ServoController for AptServo {
    async fn serial_number(&mut self) -> AppResult<String> {
        Ok(self.controller.hardware_info().await?.serial_number.to_string())
    }

    async fn is_homed(&mut self) -> AppResult<bool> {
        self.controller.is_homed().await
    }

    async fn home(&mut self) -> AppResult<()> {
        self.controller.home(self.motion_timeout).await
    }

    async fn move_to(&mut self, position: f64) -> AppResult<()> {
        let counts = to_counts(position * self.counts_per_unit)?;
        self.controller
            .move_absolute(counts, self.motion_timeout)
            .await?;
        Ok(())
    }

    async fn position(&mut self) -> AppResult<f64> {
        let counts = self.controller.position().await?;
        Ok(f64::from(counts) / self.counts_per_unit)
    }

    async fn close(&mut self) -> AppResult<()> {
        self.controller.close().await
    }
}

/// Worker for one KDC101.
pub struct Kdc101Worker {
    name: String,
    config: Kdc101Config,
    limits: Limits,
    retry: RetryPolicy,
    transport: Option<Box<dyn Transport>>,
    servo: Option<Box<dyn ServoController>>,
}

impl Kdc101Worker {
    /// Worker that will talk through `transport` once initialised.
    pub fn new(
        name: impl Into<String>,
        config: &Kdc101Config,
        transport: Box<dyn Transport>,
        retry: RetryPolicy,
    ) -> AppResult<Self> {
        Ok(Self {
            name: name.into(),
            limits: resolve_limits(config.model, config.limits)?,
            config: config.clone(),
            retry,
            transport: Some(transport),
            servo: None,
        })
    }

    fn servo(&mut self) -> AppResult<&mut Box<dyn ServoController>> {
        self.servo.as_mut().ok_or(DeviceError::NotConnected)
    }

    /// Move to every value in turn, then read the position back.
    pub async fn move_to(&mut self, values: &ChannelValues) -> AppResult<ChannelValues> {
        let mut targets = Vec::with_capacity(values.len());
        for (connection, value) in values {
            if connection != &self.config.connection {
                return Err(DeviceError::Validation(format!(
                    "{} has no connection '{}'",
                    self.name, connection
                )));
            }
            let value = value.as_analog(connection)?;
            self.limits.check(connection, value)?;
            targets.push(value);
        }
        for target in targets {
            self.servo()?.move_to(target).await?;
        }
        self.check_remote_values().await
    }
}

#[async_trait]
impl DeviceWorker for Kdc101Worker {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(device = %self.name))]
    async fn init(&mut self) -> AppResult<()> {
        let transport = self.transport.take().ok_or_else(|| {
            DeviceError::Configuration(format!("{} is already initialised", self.name))
        })?;
        let servo = AptServo::connect(transport, &self.config, &self.retry).await?;
        self.servo = Some(Box::new(servo));

        let actual = self.servo()?.serial_number().await?;
        if actual != self.config.serial_number {
            return Err(DeviceError::SerialNumberMismatch {
                connection: self.config.connection.clone(),
                actual,
                expected: self.config.serial_number.clone(),
            });
        }

        if !self.servo()?.is_homed().await? {
            if !self.config.allow_homing {
                return Err(DeviceError::Instrument(format!(
                    "{} is not homed and allow_homing is disabled",
                    self.name
                )));
            }
            info!("Homing device...");
            self.servo()?.home().await?;
            info!("Device homed.");
        }
        Ok(())
    }

    async fn program_manual(&mut self, values: &ChannelValues) -> AppResult<ChannelValues> {
        self.move_to(values).await
    }

    async fn check_remote_values(&mut self) -> AppResult<ChannelValues> {
        let position = self.servo()?.position().await?;
        Ok(ChannelValues::from([(
            self.config.connection.clone(),
            ChannelValue::Analog(position),
        )]))
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
        if let Some(mut servo) = self.servo.take() {
            if let Err(e) = servo.close().await {
                warn!(device = %self.name, error = %e, "Closing KDC101 failed");
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::models::ChildModel;
    use crate::hardware::mock::{SimulatedKCube, SimulatedTransport};

    fn config(allow_homing: bool) -> Kdc101Config {
        Kdc101Config {
            port: "/dev/ttyUSB0".into(),
            serial_number: "27000001".into(),
            baud_rate: 115_200,
            allow_homing,
            counts_per_unit: 34_304.0,
            connection: "position".into(),
            model: ChildModel::Z812,
            limits: None,
            motion_timeout_ms: 200,
        }
    }

    #[tokio::test]
    async fn test_unhomed_without_permission_fails() {
        let transport = SimulatedTransport::new("kcube", SimulatedKCube::new(27_000_001));
        let handle = transport.handle();
        let mut worker =
            Kdc101Worker::new("stage", &config(false), Box::new(transport), RetryPolicy::once())
                .unwrap();
        assert!(matches!(worker.init().await, Err(DeviceError::Instrument(_))));
        handle.with_device(|kcube| assert_eq!(kcube.homes, 0));
    }

    #[tokio::test]
    async fn test_move_in_millimetres() {
        let transport = SimulatedTransport::new("kcube", SimulatedKCube::new(27_000_001));
        let handle = transport.handle();
        let mut worker =
            Kdc101Worker::new("stage", &config(true), Box::new(transport), RetryPolicy::once())
                .unwrap();
        worker.init().await.unwrap();
        handle.with_device(|kcube| {
            assert!(kcube.channel_enabled);
            assert_eq!(kcube.homes, 1);
        });

        let values = ChannelValues::from([("position".to_string(), ChannelValue::Analog(2.5))]);
        let remote = worker.program_manual(&values).await.unwrap();
        assert_eq!(remote["position"], ChannelValue::Analog(2.5));
        handle.with_device(|kcube| assert_eq!(kcube.position, 85_760));

        let too_far = ChannelValues::from([("position".to_string(), ChannelValue::Analog(12.5))]);
        assert!(worker.program_manual(&too_far).await.is_err());
        handle.with_device(|kcube| assert_eq!(kcube.moves, 1));

        worker.shutdown().await.unwrap();
        handle.with_device(|kcube| assert!(kcube.disconnected));
    }
}
