//! Mock Hardware Implementations
//!
//! Simulated devices for running workers without physical hardware. Every
//! serial device is simulated behind the same `Transport` the real serial
//! adapter implements, so the full protocol path (framing, parsing, smart
//! programming) is exercised in mock mode.
//!
//! # Available Mocks
//!
//! - `SimulatedElliptecBus` - Elliptec interface board with any number of modules
//! - `SimulatedSynthesizer` - Agilent 83650B behind a Prologix adapter
//! - `SimulatedKCube` - KDC101 speaking the APT protocol
//! - `SimulatedPcoLibrary` - PCO SDK with a ring of simulated DMA buffers
//!
//! Each simulated transport hands out a `SimHandle` so tests can inspect the
//! bytes written and the simulated device state after the transport has been
//! moved into a worker.

pub mod agilent;
pub mod apt;
pub mod elliptec;
pub mod pco;

pub use agilent::SimulatedSynthesizer;
pub use apt::SimulatedKCube;
pub use elliptec::SimulatedElliptecBus;
pub use pco::{SimulatedPcoCamera, SimulatedPcoLibrary};

use crate::adapters::{ends_with_delimiter, Transport};
use crate::error::{AppResult, DeviceError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Device model behind a `SimulatedTransport`.
pub trait SimulatedDevice: Send + 'static {
    /// Consume bytes written by the host and return any bytes the device
    /// sends back.
    fn on_write(&mut self, data: &[u8]) -> Vec<u8>;
}

struct SimState<D> {
    device: D,
    output: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    failing_opens: u32,
}

/// Shared view of a simulated transport's state.
pub struct SimHandle<D> {
    inner: Arc<Mutex<SimState<D>>>,
}

impl<D> Clone for SimHandle<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock<D>(inner: &Mutex<SimState<D>>) -> MutexGuard<'_, SimState<D>> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

impl<D: SimulatedDevice> SimHandle<D> {
    /// Every write the host made, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.inner).writes.clone()
    }

    /// Writes decoded as text, for line protocols.
    pub fn written_lines(&self) -> Vec<String> {
        lock(&self.inner)
            .writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// Forget the recorded writes.
    pub fn clear_writes(&self) {
        lock(&self.inner).writes.clear();
    }

    /// Make the next `n` calls to `open` fail.
    pub fn fail_next_opens(&self, n: u32) {
        lock(&self.inner).failing_opens = n;
    }

    /// Inspect or modify the simulated device.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut lock(&self.inner).device)
    }
}

/// `Transport` backed by an in-process device model.
pub struct SimulatedTransport<D> {
    name: String,
    open: bool,
    inner: Arc<Mutex<SimState<D>>>,
}

impl<D: SimulatedDevice> SimulatedTransport<D> {
    /// Wrap `device` in a transport named `name`.
    pub fn new(name: impl Into<String>, device: D) -> Self {
        Self {
            name: name.into(),
            open: false,
            inner: Arc::new(Mutex::new(SimState {
                device,
                output: VecDeque::new(),
                writes: Vec::new(),
                failing_opens: 0,
            })),
        }
    }

    /// Handle for inspecting the simulation.
    pub fn handle(&self) -> SimHandle<D> {
        SimHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }
}

#[async_trait]
impl<D: SimulatedDevice> Transport for SimulatedTransport<D> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self) -> AppResult<()> {
        let mut state = lock(&self.inner);
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(DeviceError::Transport(format!(
                "Simulated device '{}' not found",
                self.name
            )));
        }
        state.output.clear();
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn write(&mut self, data: &[u8]) -> AppResult<()> {
        self.ensure_open()?;
        let mut state = lock(&self.inner);
        state.writes.push(data.to_vec());
        let reply = state.device.on_write(data);
        state.output.extend(reply);
        debug!(device = %self.name, bytes = data.len(), "Simulated write");
        Ok(())
    }

    async fn read_until(&mut self, delimiter: &[u8], timeout: Duration) -> AppResult<Vec<u8>> {
        self.ensure_open()?;
        let mut state = lock(&self.inner);
        let mut response = Vec::new();
        while let Some(byte) = state.output.pop_front() {
            response.push(byte);
            if ends_with_delimiter(&response, delimiter) {
                return Ok(response);
            }
        }
        // Nothing more will arrive; put back what was read
        for byte in response.into_iter().rev() {
            state.output.push_front(byte);
        }
        Err(DeviceError::Timeout(format!(
            "No reply from simulated device '{}' within {:?}",
            self.name, timeout
        )))
    }

    async fn read_exact(&mut self, len: usize, timeout: Duration) -> AppResult<Vec<u8>> {
        self.ensure_open()?;
        let mut state = lock(&self.inner);
        if state.output.len() < len {
            return Err(DeviceError::Timeout(format!(
                "Simulated device '{}' has {} of {} bytes after {:?}",
                self.name,
                state.output.len(),
                len,
                timeout
            )));
        }
        Ok(state.output.drain(..len).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl SimulatedDevice for Echo {
        fn on_write(&mut self, data: &[u8]) -> Vec<u8> {
            let mut reply = data.to_vec();
            reply.extend_from_slice(b"\r\n");
            reply
        }
    }

    #[tokio::test]
    async fn test_simulated_transport_round_trip() {
        let mut transport = SimulatedTransport::new("echo", Echo);
        let handle = transport.handle();
        assert!(transport.write(b"hi").await.is_err());

        transport.open().await.unwrap();
        transport.write_line("ping", "").await.unwrap();
        let line = transport
            .read_line("\r\n", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(line, "ping");
        assert!(transport
            .read_until(b"\r\n", Duration::from_millis(10))
            .await
            .is_err());
        assert_eq!(handle.written_lines(), vec!["ping".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_opens() {
        let mut transport = SimulatedTransport::new("echo", Echo);
        transport.handle().fail_next_opens(2);
        assert!(transport.open().await.is_err());
        assert!(transport.open().await.is_err());
        assert!(transport.open().await.is_ok());
        assert!(transport.is_open());
    }
}
