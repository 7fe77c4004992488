//! Transport adapters
//!
//! This module contains the `Transport` trait, the low-level byte pipe every
//! serial-attached device talks through, and its implementations. Device
//! modules never open ports themselves: they receive a boxed transport chosen
//! once at startup, either a real serial port or a simulated device from
//! [`crate::hardware::mock`].

pub mod serial_adapter;

pub use serial_adapter::SerialAdapter;

use crate::error::{AppResult, DeviceError};
use async_trait::async_trait;
use std::time::Duration;

/// Byte-oriented, half-duplex connection to one instrument bus.
#[async_trait]
pub trait Transport: Send {
    /// Short human-readable name used in log messages.
    fn name(&self) -> &str;

    /// Open the underlying connection.
    async fn open(&mut self) -> AppResult<()>;

    /// Close the underlying connection. Closing twice is not an error.
    async fn close(&mut self) -> AppResult<()>;

    /// Whether `open` has succeeded and `close` has not been called since.
    fn is_open(&self) -> bool;

    /// Write raw bytes.
    async fn write(&mut self, data: &[u8]) -> AppResult<()>;

    /// Read until `delimiter` has been received. The delimiter is included in
    /// the returned bytes.
    async fn read_until(&mut self, delimiter: &[u8], timeout: Duration) -> AppResult<Vec<u8>>;

    /// Read exactly `len` bytes.
    async fn read_exact(&mut self, len: usize, timeout: Duration) -> AppResult<Vec<u8>>;

    /// Write `line` followed by `termination`.
    async fn write_line(&mut self, line: &str, termination: &str) -> AppResult<()> {
        let mut buf = Vec::with_capacity(line.len() + termination.len());
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(termination.as_bytes());
        self.write(&buf).await
    }

    /// Read one line terminated by `termination` and return it without the
    /// terminator.
    async fn read_line(&mut self, termination: &str, timeout: Duration) -> AppResult<String> {
        let raw = self.read_until(termination.as_bytes(), timeout).await?;
        let body = raw
            .strip_suffix(termination.as_bytes())
            .unwrap_or(raw.as_slice());
        String::from_utf8(body.to_vec())
            .map_err(|e| DeviceError::Transport(format!("Invalid UTF-8 from {}: {}", self.name(), e)))
    }
}

/// Locate `needle` at the end of `haystack`.
pub(crate) fn ends_with_delimiter(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.len() >= needle.len() && haystack.ends_with(needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ends_with_delimiter() {
        assert!(ends_with_delimiter(b"0PO00000000\r\n", b"\r\n"));
        assert!(!ends_with_delimiter(b"0PO0000", b"\r\n"));
        assert!(!ends_with_delimiter(b"\n", b""));
    }
}
