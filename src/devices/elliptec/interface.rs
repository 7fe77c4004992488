//! Connection to an Elliptec interface board.

use crate::adapters::Transport;
use crate::devices::elliptec::codec::{self, DeviceInfo, Reply, MAX_ADDRESS, POSITION_BITS};
use crate::devices::elliptec::ElliptecError;
use crate::error::{AppResult, DeviceError};
use crate::error_recovery::{open_with_retry, RetryPolicy};
use std::time::Duration;
use tracing::{debug, info};

/// Replies end with CR LF.
pub const READ_TERMINATION: &str = "\r\n";

/// Default read timeout. Homing a rotation mount can take several seconds.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One Elliptec bus.
///
/// Holds the smart-programming cache: the last absolute target written to each
/// of the sixteen addresses. Homing and relative moves invalidate the entry.
pub struct ElliptecInterface {
    transport: Box<dyn Transport>,
    timeout: Duration,
    last_set_positions: [Option<i64>; (MAX_ADDRESS as usize) + 1],
}

impl ElliptecInterface {
    /// Open the transport (with retry) and reset the bus receivers.
    pub async fn connect(
        mut transport: Box<dyn Transport>,
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> AppResult<Self> {
        open_with_retry(transport.as_mut(), policy).await?;
        let mut interface = Self {
            transport,
            timeout,
            last_set_positions: [None; (MAX_ADDRESS as usize) + 1],
        };
        interface.clear_receiving_state_machine().await?;
        Ok(interface)
    }

    /// Send a bare carriage return, which resets a half-received frame in
    /// every module on the bus.
    pub async fn clear_receiving_state_machine(&mut self) -> AppResult<()> {
        self.transport.write(b"\r").await
    }

    /// Write `[address][message]`.
    pub async fn write(&mut self, address: u8, message: &str) -> AppResult<()> {
        let frame = codec::frame(address, message, "")?;
        debug!(bus = self.transport.name(), frame = %frame, "Elliptec write");
        self.transport.write(frame.as_bytes()).await
    }

    /// Read one reply line.
    pub async fn read(&mut self) -> AppResult<Reply> {
        let line = self
            .transport
            .read_line(READ_TERMINATION, self.timeout)
            .await?;
        debug!(bus = self.transport.name(), reply = %line, "Elliptec read");
        Reply::parse(&line)
    }

    /// Write then read, optionally pausing in between.
    pub async fn query(
        &mut self,
        address: u8,
        message: &str,
        delay: Option<Duration>,
    ) -> AppResult<Reply> {
        self.write(address, message).await?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self.read().await?;
        if reply.address != address {
            return Err(DeviceError::Instrument(format!(
                "Expected reply from address {:X}, got {:X}",
                address, reply.address
            )));
        }
        Ok(reply)
    }

    /// Raw `IN` reply.
    pub async fn get_info(&mut self, address: u8) -> AppResult<String> {
        let reply = self.query(address, "in", None).await?;
        Ok(format!(
            "{}{}{}",
            codec::address_char(reply.address)?,
            reply.command,
            reply.data
        ))
    }

    /// Decoded `IN` reply.
    pub async fn get_device_info(&mut self, address: u8) -> AppResult<DeviceInfo> {
        let info = self.get_info(address).await?;
        DeviceInfo::parse(&info)
    }

    /// Eight-digit serial number of the module at `address`.
    pub async fn get_serial_number(&mut self, address: u8) -> AppResult<String> {
        Ok(self.get_device_info(address).await?.serial_number)
    }

    /// Query `GS` and turn a non-zero status into an error.
    pub async fn check_status(&mut self, address: u8) -> AppResult<()> {
        let reply = self.query(address, "gs", None).await?;
        let code = reply.status_code()?;
        if code != 0 {
            return Err(DeviceError::Elliptec {
                address,
                source: ElliptecError::new(code),
            });
        }
        Ok(())
    }

    /// Home the module. `clockwise` only matters for rotation mounts.
    pub async fn home(&mut self, address: u8, clockwise: bool) -> AppResult<i64> {
        self.last_set_positions[Self::slot(address)?] = None;
        let direction = if clockwise { "0" } else { "1" };
        info!(address, clockwise, "Homing Elliptec module");
        let reply = self
            .query(address, &format!("ho{}", direction), None)
            .await?
            .into_result()?;
        Self::position_from(reply)
    }

    /// Current position in counts.
    pub async fn get_position(&mut self, address: u8) -> AppResult<i64> {
        let reply = self.query(address, "gp", None).await?.into_result()?;
        Self::position_from(reply)
    }

    /// Move to an absolute position.
    ///
    /// Returns `None` when the target equals the last value written to this
    /// address and `fresh` is false; no command is sent in that case.
    pub async fn move_absolute(
        &mut self,
        address: u8,
        counts: i64,
        fresh: bool,
    ) -> AppResult<Option<i64>> {
        let slot = Self::slot(address)?;
        if !fresh && self.last_set_positions[slot] == Some(counts) {
            debug!(address, counts, "Skipping unchanged Elliptec move");
            return Ok(None);
        }
        let payload = codec::encode_counts(counts, POSITION_BITS)?;
        // Forget the target until the module confirms it
        self.last_set_positions[slot] = None;
        let reply = self
            .query(address, &format!("ma{}", payload), None)
            .await?
            .into_result()?;
        self.last_set_positions[slot] = Some(counts);
        Self::position_from(reply).map(Some)
    }

    /// Move by a relative offset. Always sent.
    pub async fn move_relative(&mut self, address: u8, counts: i64) -> AppResult<i64> {
        self.last_set_positions[Self::slot(address)?] = None;
        let payload = codec::encode_counts(counts, POSITION_BITS)?;
        let reply = self
            .query(address, &format!("mr{}", payload), None)
            .await?
            .into_result()?;
        Self::position_from(reply)
    }

    /// Last absolute target written to `address`, if still valid.
    pub fn last_set_position(&self, address: u8) -> Option<i64> {
        self.last_set_positions
            .get(usize::from(address))
            .copied()
            .flatten()
    }

    /// Close the underlying transport.
    pub async fn close(&mut self) -> AppResult<()> {
        self.transport.close().await
    }

    fn slot(address: u8) -> AppResult<usize> {
        codec::address_char(address)?;
        Ok(usize::from(address))
    }

    fn position_from(reply: Reply) -> AppResult<i64> {
        if !reply.command.eq_ignore_ascii_case("PO") {
            return Err(DeviceError::Instrument(format!(
                "Expected position reply from address {:X}, got '{}{}'",
                reply.address, reply.command, reply.data
            )));
        }
        codec::decode_counts(&reply.data, None)
    }
}
