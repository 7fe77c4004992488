//! Agilent 83650B microwave synthesizer over a Prologix USB-GPIB adapter.
//!
//! Protocol Overview:
//! - Lines starting with `++` configure the Prologix adapter and never reach
//!   the GPIB bus
//! - Everything else is SCPI forwarded to the synthesizer at `++addr`
//! - Auto-read is disabled, so every reply is fetched explicitly with `++read`
//!
//! The worker exposes a single DDS-like output, connection `dds 0`, with
//! `freq` in Hz, `amp` in dBm and `gate` for the RF output switch.

use crate::adapters::Transport;
use crate::config::Agilent83650bConfig;
use crate::error::{AppResult, DeviceError};
use crate::error_recovery::{open_with_retry, RetryPolicy};
use crate::shot::ShotFile;
use crate::worker::{needs_write, ChannelValue, ChannelValues, DdsValues, DeviceWorker};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Name of the only output.
pub const CONNECTION: &str = "dds 0";

/// Line terminator used towards the adapter and in its replies.
const TERMINATION: &str = "\n";

/// Range and resolution of one output quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputCapability {
    /// Base unit.
    pub base_unit: &'static str,
    /// Lowest accepted value.
    pub min: f64,
    /// Highest accepted value.
    pub max: f64,
    /// Front-panel step.
    pub step: f64,
    /// Decimals shown on the front panel.
    pub decimals: u32,
}

impl OutputCapability {
    fn check(&self, what: &str, value: f64) -> AppResult<()> {
        if value.is_nan() || value < self.min || value > self.max {
            return Err(DeviceError::Validation(format!(
                "{} of {} {} is outside [{}, {}]",
                what, value, self.base_unit, self.min, self.max
            )));
        }
        Ok(())
    }
}

/// CW frequency.
pub const FREQUENCY: OutputCapability = OutputCapability {
    base_unit: "Hz",
    min: 10e6,
    max: 50e9,
    step: 1.0,
    decimals: 0,
};

/// Output power.
pub const AMPLITUDE: OutputCapability = OutputCapability {
    base_unit: "dBm",
    min: -20.0,
    max: 10.0,
    step: 0.2,
    decimals: 2,
};

/// One value per output setting.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OutputSettings {
    /// CW frequency in Hz.
    pub frequency: Option<f64>,
    /// Power in dBm.
    pub power: Option<f64>,
    /// RF output on.
    pub output_enabled: Option<bool>,
}

/// Smart-programming cache.
///
/// `last_set` holds what was commanded; `last_actual` holds what the
/// synthesizer reported right after, which is returned when a write is
/// skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SynthState {
    /// Last commanded values.
    pub last_set: OutputSettings,
    /// Values read back after the last write.
    pub last_actual: OutputSettings,
}

/// Connection to the synthesizer.
pub struct Agilent83650B {
    transport: Box<dyn Transport>,
    gpib_address: u8,
    ramp_between_frequencies: bool,
    timeout: Duration,
    state: SynthState,
}

impl Agilent83650B {
    /// Open the adapter (with retry) and configure it for this synthesizer.
    pub async fn connect(
        mut transport: Box<dyn Transport>,
        config: &Agilent83650bConfig,
        policy: &RetryPolicy,
    ) -> AppResult<Self> {
        open_with_retry(transport.as_mut(), policy).await?;
        let mut synth = Self {
            transport,
            gpib_address: config.gpib_address,
            ramp_between_frequencies: config.ramp_between_frequencies,
            timeout: Duration::from_millis(config.timeout_ms),
            state: SynthState::default(),
        };
        synth.configure_gpib_interface().await?;
        Ok(synth)
    }

    /// Put the Prologix adapter in controller mode addressing the synth.
    async fn configure_gpib_interface(&mut self) -> AppResult<()> {
        self.write("++mode 1").await?;
        // Auto-read errors on commands without a reply
        self.write("++auto 0").await?;
        self.write(&format!("++addr {}", self.gpib_address)).await?;
        // Terminate GPIB messages with LF and assert EOI
        self.write("++eos 2").await?;
        self.write("++eoi 1").await
    }

    /// Send one line.
    pub async fn write(&mut self, command: &str) -> AppResult<()> {
        debug!(command, "Sending");
        self.transport.write_line(command, TERMINATION).await
    }

    /// Fetch one reply from the synthesizer.
    pub async fn read(&mut self) -> AppResult<String> {
        self.write("++read").await?;
        let response = self.transport.read_line(TERMINATION, self.timeout).await?;
        let response = response.trim().to_string();
        debug!(response = %response, "Received");
        Ok(response)
    }

    async fn query_f64(&mut self, command: &str) -> AppResult<f64> {
        self.write(command).await?;
        let text = self.read().await?;
        text.parse::<f64>().map_err(|_| {
            DeviceError::Instrument(format!("Unexpected reply '{}' to '{}'", text, command))
        })
    }

    /// Current smart-programming cache.
    pub fn state(&self) -> &SynthState {
        &self.state
    }

    /// Whether the RF output is on.
    pub async fn output_enabled(&mut self) -> AppResult<bool> {
        let value = self.query_f64(":POWer:STATe?").await?;
        Ok(value != 0.0)
    }

    /// Switch the RF output and record the read-back state.
    pub async fn set_output_enabled(&mut self, enabled: bool) -> AppResult<()> {
        self.write(&format!(":POWer:STATe {}", u8::from(enabled)))
            .await?;
        self.state.last_set.output_enabled = Some(enabled);
        self.state.last_actual.output_enabled = Some(self.output_enabled().await?);
        Ok(())
    }

    /// CW frequency in Hz.
    pub async fn frequency(&mut self) -> AppResult<f64> {
        self.query_f64(":FREQuency:CW?").await
    }

    /// Set the CW frequency and record the read-back value.
    pub async fn set_frequency(&mut self, frequency: f64) -> AppResult<()> {
        FREQUENCY.check("Frequency", frequency)?;
        if self.ramp_between_frequencies {
            return Err(DeviceError::FeatureIncomplete(
                "ramp_between_frequencies".to_string(),
                "Ramping between frequencies is not yet implemented.".to_string(),
            ));
        }
        self.write(&format!(":FREQuency:CW {} Hz", frequency)).await?;
        self.state.last_set.frequency = Some(frequency);
        self.state.last_actual.frequency = Some(self.frequency().await?);
        Ok(())
    }

    /// Output power in dBm.
    pub async fn power(&mut self) -> AppResult<f64> {
        self.query_f64(":POWer:LEVel?").await
    }

    /// Set the output power and record the read-back value.
    pub async fn set_power(&mut self, power: f64) -> AppResult<()> {
        AMPLITUDE.check("Power", power)?;
        self.write(&format!(":POWer:LEVel {:.2} dBm", power)).await?;
        self.state.last_set.power = Some(power);
        self.state.last_actual.power = Some(self.power().await?);
        Ok(())
    }

    /// Set the frequency unless it equals the last commanded one. Returns
    /// the last read-back frequency.
    pub async fn smart_set_frequency(&mut self, frequency: f64, fresh: bool) -> AppResult<f64> {
        if needs_write(fresh, self.state.last_set.frequency.as_ref(), &frequency) {
            self.set_frequency(frequency).await?;
            info!(frequency, "Set frequency");
        } else {
            debug!("Used smart programming; didn't change frequency");
        }
        self.cached(self.state.last_actual.frequency, "frequency")
    }

    /// Set the power unless it equals the last commanded one. Returns the
    /// last read-back power.
    pub async fn smart_set_power(&mut self, power: f64, fresh: bool) -> AppResult<f64> {
        if needs_write(fresh, self.state.last_set.power.as_ref(), &power) {
            self.set_power(power).await?;
            info!(power, "Set power");
        } else {
            debug!("Used smart programming; didn't change power");
        }
        self.cached(self.state.last_actual.power, "power")
    }

    /// Switch the output unless the state equals the last commanded one.
    /// Returns the last read-back state.
    pub async fn smart_set_output_enabled(&mut self, enabled: bool, fresh: bool) -> AppResult<bool> {
        if needs_write(fresh, self.state.last_set.output_enabled.as_ref(), &enabled) {
            self.set_output_enabled(enabled).await?;
            info!(enabled, "Set output_enabled");
        } else {
            debug!("Used smart programming; didn't change output_enabled");
        }
        self.cached(self.state.last_actual.output_enabled, "output_enabled")
    }

    fn cached<T>(&self, value: Option<T>, what: &str) -> AppResult<T> {
        value.ok_or_else(|| {
            DeviceError::Instrument(format!("No read-back value recorded for {}", what))
        })
    }

    /// Close the adapter connection.
    pub async fn close(&mut self) -> AppResult<()> {
        self.transport.close().await
    }
}

/// Worker for the synthesizer.
pub struct Agilent83650BWorker {
    name: String,
    config: Agilent83650bConfig,
    retry: RetryPolicy,
    transport: Option<Box<dyn Transport>>,
    synth: Option<Agilent83650B>,
}

impl Agilent83650BWorker {
    /// Worker that will talk through `transport` once initialised.
    pub fn new(
        name: impl Into<String>,
        config: &Agilent83650bConfig,
        transport: Box<dyn Transport>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            config: config.clone(),
            retry,
            transport: Some(transport),
            synth: None,
        }
    }

    fn synth(&mut self) -> AppResult<&mut Agilent83650B> {
        self.synth.as_mut().ok_or(DeviceError::NotConnected)
    }

    /// Program every connection in `values` and return the read-back values.
    pub async fn set_output_settings(
        &mut self,
        values: &ChannelValues,
        fresh: bool,
    ) -> AppResult<ChannelValues> {
        let mut actual = ChannelValues::new();
        for (connection, value) in values {
            if connection != CONNECTION {
                return Err(DeviceError::Validation(format!(
                    "{} has no output '{}'",
                    self.name, connection
                )));
            }
            let target = value.as_dds(connection)?;
            FREQUENCY.check("Frequency", target.freq)?;
            AMPLITUDE.check("Power", target.amp)?;

            let synth = self.synth()?;
            let freq = synth.smart_set_frequency(target.freq, fresh).await?;
            let amp = synth.smart_set_power(target.amp, fresh).await?;
            let gate = synth.smart_set_output_enabled(target.gate, fresh).await?;
            actual.insert(
                connection.clone(),
                ChannelValue::Dds(DdsValues { freq, amp, gate }),
            );
        }
        Ok(actual)
    }
}

#[async_trait]
impl DeviceWorker for Agilent83650BWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self) -> AppResult<()> {
        let transport = self.transport.take().ok_or_else(|| {
            DeviceError::Configuration(format!("{} is already initialised", self.name))
        })?;
        let synth = Agilent83650B::connect(transport, &self.config, &self.retry).await?;
        self.synth = Some(synth);
        info!(device = %self.name, gpib_address = self.config.gpib_address, "Synthesizer ready");
        Ok(())
    }

    async fn program_manual(&mut self, values: &ChannelValues) -> AppResult<ChannelValues> {
        self.set_output_settings(values, true).await
    }

    async fn check_remote_values(&mut self) -> AppResult<ChannelValues> {
        let synth = self.synth()?;
        let freq = synth.frequency().await?;
        let amp = synth.power().await?;
        let gate = synth.output_enabled().await?;
        Ok(ChannelValues::from([(
            CONNECTION.to_string(),
            ChannelValue::Dds(DdsValues { freq, amp, gate }),
        )]))
    }

    async fn transition_to_buffered(
        &mut self,
        device_name: &str,
        shot: Arc<dyn ShotFile>,
        _initial_values: &ChannelValues,
        fresh: bool,
    ) -> AppResult<ChannelValues> {
        let Some(table) = shot.static_values(device_name)? else {
            return Ok(ChannelValues::new());
        };
        let field = |key: &str| {
            table.get(key).copied().ok_or_else(|| {
                DeviceError::ShotFile(format!(
                    "Static value table of {} has no '{}'",
                    device_name, key
                ))
            })
        };
        let dds = DdsValues {
            freq: field("freq")?,
            amp: field("amp")?,
            gate: field("gate")? != 0.0,
        };
        let values = ChannelValues::from([(CONNECTION.to_string(), ChannelValue::Dds(dds))]);
        self.set_output_settings(&values, fresh).await
    }

    async fn transition_to_manual(&mut self) -> AppResult<bool> {
        Ok(true)
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        if let Some(mut synth) = self.synth.take() {
            synth.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{SimulatedSynthesizer, SimulatedTransport};

    fn config() -> Agilent83650bConfig {
        Agilent83650bConfig {
            com_port: "COM7".into(),
            gpib_address: 19,
            baud_rate: 115_200,
            timeout_ms: 50,
            ramp_between_frequencies: false,
        }
    }

    #[tokio::test]
    async fn test_prologix_setup_sequence() {
        let transport = SimulatedTransport::new("prologix", SimulatedSynthesizer::new(19));
        let handle = transport.handle();
        Agilent83650B::connect(Box::new(transport), &config(), &RetryPolicy::once())
            .await
            .unwrap();
        assert_eq!(
            handle.written_lines(),
            vec!["++mode 1\n", "++auto 0\n", "++addr 19\n", "++eos 2\n", "++eoi 1\n"]
        );
    }

    #[tokio::test]
    async fn test_power_formatted_with_two_decimals() {
        let transport = SimulatedTransport::new("prologix", SimulatedSynthesizer::new(19));
        let handle = transport.handle();
        let mut synth = Agilent83650B::connect(Box::new(transport), &config(), &RetryPolicy::once())
            .await
            .unwrap();
        synth.set_power(-3.456).await.unwrap();
        assert!(handle
            .written_lines()
            .contains(&":POWer:LEVel -3.46 dBm\n".to_string()));
        assert_eq!(synth.state().last_actual.power, Some(-3.46));
    }

    #[tokio::test]
    async fn test_ramping_is_rejected() {
        let mut cfg = config();
        cfg.ramp_between_frequencies = true;
        let transport = SimulatedTransport::new("prologix", SimulatedSynthesizer::new(19));
        let mut synth = Agilent83650B::connect(Box::new(transport), &cfg, &RetryPolicy::once())
            .await
            .unwrap();
        assert!(matches!(
            synth.set_frequency(1e9).await,
            Err(DeviceError::FeatureIncomplete(..))
        ));
    }

    #[tokio::test]
    async fn test_limits() {
        let transport = SimulatedTransport::new("prologix", SimulatedSynthesizer::new(19));
        let mut synth = Agilent83650B::connect(Box::new(transport), &config(), &RetryPolicy::once())
            .await
            .unwrap();
        assert!(synth.set_frequency(1e6).await.is_err());
        assert!(synth.set_power(11.0).await.is_err());
        assert!(synth.set_frequency(50e9).await.is_ok());
    }
}
