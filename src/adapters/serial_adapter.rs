#[cfg(feature = "instrument_serial")]
use crate::adapters::ends_with_delimiter;
use crate::adapters::Transport;
use crate::error::{AppResult, DeviceError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;

/// Serial adapter for RS-232 / USB-serial communication
///
/// This adapter wraps the serialport crate and provides async I/O
/// using Tokio's blocking task executor for synchronous serial operations.
#[derive(Clone)]
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600, 115200)
    baud_rate: u32,

    /// The actual serial port (behind Arc<Mutex> for async access)
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialAdapter {
    /// Create a new, unopened serial adapter.
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed (e.g., 9600, 115200)
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Port path this adapter opens.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Configured baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    #[cfg(feature = "instrument_serial")]
    fn port(&self) -> AppResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port.clone().ok_or(DeviceError::NotConnected)
    }

    /// Blocking read loop shared by `read_until` and `read_exact`.
    #[cfg(feature = "instrument_serial")]
    async fn read_with<F>(&self, timeout: Duration, done: F) -> AppResult<Vec<u8>>
    where
        F: Fn(&[u8]) -> bool + Send + 'static,
    {
        let port = self.port()?;
        let name = self.port_name.clone();

        // Execute blocking serial I/O on dedicated thread
        tokio::task::spawn_blocking(move || -> AppResult<Vec<u8>> {
            use std::io::Read;

            let mut port_guard = port.blocking_lock();
            let mut response = Vec::new();
            let mut byte = [0u8; 1];
            let start = std::time::Instant::now();

            while !done(&response) {
                if start.elapsed() > timeout {
                    return Err(DeviceError::Timeout(format!(
                        "Serial read on '{}' after {:?} ({} bytes received)",
                        name,
                        timeout,
                        response.len()
                    )));
                }

                match port_guard.read(&mut byte) {
                    Ok(0) => {
                        return Err(DeviceError::Transport(format!(
                            "Unexpected EOF from serial port '{}'",
                            name
                        )));
                    }
                    Ok(_) => response.push(byte[0]),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        // Port timeout is shorter than our overall timeout
                        continue;
                    }
                    Err(e) => return Err(DeviceError::Io(e)),
                }
            }

            Ok(response)
        })
        .await?
    }
}

#[async_trait]
impl Transport for SerialAdapter {
    fn name(&self) -> &str {
        &self.port_name
    }

    async fn open(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let name = self.port_name.clone();
            let baud_rate = self.baud_rate;
            let port = tokio::task::spawn_blocking(move || {
                serialport::new(&name, baud_rate)
                    .timeout(Duration::from_millis(100)) // Internal read timeout
                    .open()
            })
            .await?
            .map_err(|e| {
                DeviceError::Transport(format!(
                    "Failed to open serial port '{}' at {} baud: {}",
                    self.port_name, self.baud_rate, e
                ))
            })?;

            self.port = Some(Arc::new(Mutex::new(port)));
            debug!(port = %self.port_name, baud = self.baud_rate, "Serial port opened");
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(DeviceError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!(port = %self.port_name, "Serial port closed");
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    async fn write(&mut self, data: &[u8]) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            let data = data.to_vec();
            let name = self.port_name.clone();

            tokio::task::spawn_blocking(move || -> AppResult<()> {
                use std::io::Write;

                let mut port_guard = port.blocking_lock();
                port_guard.write_all(&data)?;
                port_guard.flush()?;
                debug!(port = %name, bytes = data.len(), "Sent serial data");
                Ok(())
            })
            .await?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = data;
            Err(DeviceError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }

    async fn read_until(&mut self, delimiter: &[u8], timeout: Duration) -> AppResult<Vec<u8>> {
        #[cfg(feature = "instrument_serial")]
        {
            let delimiter = delimiter.to_vec();
            let response = self
                .read_with(timeout, move |buf| ends_with_delimiter(buf, &delimiter))
                .await?;
            debug!(port = %self.port_name, response = %String::from_utf8_lossy(&response).trim(), "Received serial response");
            Ok(response)
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (delimiter, timeout);
            Err(DeviceError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }

    async fn read_exact(&mut self, len: usize, timeout: Duration) -> AppResult<Vec<u8>> {
        #[cfg(feature = "instrument_serial")]
        {
            self.read_with(timeout, move |buf| buf.len() >= len).await
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (len, timeout);
            Err(DeviceError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_adapter_creation() {
        let adapter = SerialAdapter::new("/dev/ttyUSB0", 9600);
        assert_eq!(adapter.name(), "/dev/ttyUSB0");
        assert_eq!(adapter.baud_rate(), 9600);
        assert!(!adapter.is_open());
    }

    #[tokio::test]
    async fn test_write_before_open_fails() {
        let mut adapter = SerialAdapter::new("COM3", 115200);
        assert!(adapter.write(b"0gp").await.is_err());
    }
}
