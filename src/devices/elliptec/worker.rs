use crate::adapters::Transport;
use crate::config::{ElliptecAxisConfig, ElliptecConfig, ElliptecUnits};
use crate::devices::elliptec::codec::parse_address;
use crate::devices::elliptec::{Ell14UnitConverter, ElliptecInterface};
use crate::devices::models::{resolve_limits, Limits};
use crate::error::{AppResult, DeviceError};
use crate::error_recovery::RetryPolicy;
use crate::shot::ShotFile;
use crate::worker::{ChannelValue, ChannelValues, DeviceWorker};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

struct Axis {
    connection: String,
    address: u8,
    serial_number: Option<String>,
    home_on_startup: bool,
    limits: Limits,
    /// Set when values are in degrees
    degrees: Option<Ell14UnitConverter>,
}

impl Axis {
    fn from_config(cfg: &ElliptecAxisConfig) -> AppResult<Self> {
        Ok(Self {
            connection: cfg.connection.clone(),
            address: parse_address(&cfg.connection)?,
            serial_number: cfg.serial_number.clone(),
            home_on_startup: cfg.home_on_startup,
            limits: resolve_limits(cfg.model, cfg.limits)?,
            degrees: match cfg.units {
                ElliptecUnits::Counts => None,
                ElliptecUnits::Deg => Some(Ell14UnitConverter::default()),
            },
        })
    }

    fn to_counts(&self, value: f64) -> f64 {
        match &self.degrees {
            Some(converter) => converter.deg_to_counts(value),
            None => value,
        }
    }

    fn from_counts(&self, counts: i64) -> f64 {
        match &self.degrees {
            Some(converter) => converter.counts_to_deg(counts as f64),
            None => counts as f64,
        }
    }
}

/// Worker for an Elliptec interface board and its modules.
///
/// Channel values are positions keyed by the module's bus address, in encoder
/// counts or, for axes configured with `units = "deg"`, degrees.
pub struct ElliptecWorker {
    name: String,
    axes: Vec<Axis>,
    timeout: Duration,
    retry: RetryPolicy,
    transport: Option<Box<dyn Transport>>,
    interface: Option<ElliptecInterface>,
}

impl ElliptecWorker {
    /// Worker that will talk through `transport` once initialised.
    pub fn new(
        name: impl Into<String>,
        config: &ElliptecConfig,
        transport: Box<dyn Transport>,
        retry: RetryPolicy,
    ) -> AppResult<Self> {
        let axes = config
            .axes
            .iter()
            .map(Axis::from_config)
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self {
            name: name.into(),
            axes,
            timeout: Duration::from_millis(config.timeout_ms),
            retry,
            transport: Some(transport),
            interface: None,
        })
    }

    fn interface(&mut self) -> AppResult<&mut ElliptecInterface> {
        self.interface.as_mut().ok_or(DeviceError::NotConnected)
    }

    fn axis(&self, connection: &str) -> AppResult<&Axis> {
        self.axes
            .iter()
            .find(|a| a.connection.eq_ignore_ascii_case(connection))
            .ok_or_else(|| {
                DeviceError::Validation(format!(
                    "{} has no Elliptec device at connection '{}'",
                    self.name, connection
                ))
            })
    }

    /// Compare the serial numbers in the connection table with the modules.
    pub async fn check_serial_numbers(&mut self) -> AppResult<()> {
        let expected: Vec<(String, u8, String)> = self
            .axes
            .iter()
            .filter_map(|a| {
                a.serial_number
                    .clone()
                    .map(|s| (a.connection.clone(), a.address, s))
            })
            .collect();
        for (connection, address, expected) in expected {
            let actual = self.interface()?.get_serial_number(address).await?;
            if actual != expected {
                return Err(DeviceError::SerialNumberMismatch {
                    connection,
                    actual,
                    expected,
                });
            }
        }
        Ok(())
    }

    /// Home the modules flagged `home_on_startup`.
    pub async fn do_homing(&mut self) -> AppResult<()> {
        let addresses: Vec<u8> = self
            .axes
            .iter()
            .filter(|a| a.home_on_startup)
            .map(|a| a.address)
            .collect();
        for address in addresses {
            self.interface()?.home(address, true).await?;
        }
        Ok(())
    }

    /// Move each connection to its value, then read all positions back.
    ///
    /// Degrees are wrapped into `[0, 360)` and converted before the limit
    /// check. Values are rounded to whole counts. With `fresh` unset, modules
    /// whose last target equals the new one are not commanded.
    pub async fn move_to(&mut self, values: &ChannelValues, fresh: bool) -> AppResult<ChannelValues> {
        // Validate everything before touching the bus
        let mut targets = Vec::with_capacity(values.len());
        for (connection, value) in values {
            let axis = self.axis(connection)?;
            let counts = axis.to_counts(value.as_analog(connection)?);
            axis.limits.check(connection, counts)?;
            targets.push((axis.address, counts.round() as i64));
        }
        for (address, counts) in targets {
            self.interface()?.move_absolute(address, counts, fresh).await?;
        }
        self.check_remote_values().await
    }
}

#[async_trait]
impl DeviceWorker for ElliptecWorker {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(device = %self.name))]
    async fn init(&mut self) -> AppResult<()> {
        let transport = self.transport.take().ok_or_else(|| {
            DeviceError::Configuration(format!("{} is already initialised", self.name))
        })?;
        let interface = ElliptecInterface::connect(transport, self.timeout, &self.retry).await?;
        self.interface = Some(interface);
        self.check_serial_numbers().await?;
        self.do_homing().await?;
        info!(axes = self.axes.len(), "Elliptec bus ready");
        Ok(())
    }

    async fn program_manual(&mut self, values: &ChannelValues) -> AppResult<ChannelValues> {
        self.move_to(values, true).await
    }

    async fn check_remote_values(&mut self) -> AppResult<ChannelValues> {
        let mut remote = ChannelValues::new();
        for index in 0..self.axes.len() {
            let address = self.axes[index].address;
            let position = self.interface()?.get_position(address).await?;
            let axis = &self.axes[index];
            remote.insert(axis.connection.clone(), ChannelValue::Analog(axis.from_counts(position)));
        }
        Ok(remote)
    }

    async fn transition_to_buffered(
        &mut self,
        device_name: &str,
        shot: Arc<dyn ShotFile>,
        _initial_values: &ChannelValues,
        fresh: bool,
    ) -> AppResult<ChannelValues> {
        let values: ChannelValues = shot
            .static_values(device_name)?
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, ChannelValue::Analog(v)))
            .collect();
        self.move_to(&values, fresh).await
    }

    async fn transition_to_manual(&mut self) -> AppResult<bool> {
        Ok(true)
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        if let Some(mut interface) = self.interface.take() {
            interface.close().await?;
        }
        Ok(())
    }
}
