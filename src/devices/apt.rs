//! Thorlabs APT binary protocol
//!
//! Every message starts with a 6-byte header:
//!
//! ```text
//! bytes 0-1  message id, little endian
//! bytes 2-3  param1, param2, or the data length (LE) when a data packet follows
//! byte  4    destination, bit 7 set when a data packet follows
//! byte  5    source
//! ```
//!
//! All multi-byte fields are little endian. The host is `0x01`; a single
//! channel K-Cube answers as `0x50`.

use crate::adapters::Transport;
use crate::error::{AppResult, DeviceError};
use crate::error_recovery::{open_with_retry, RetryPolicy};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Message ids used by the DC servo controllers.
#[allow(missing_docs)]
pub mod ids {
    pub const HW_DISCONNECT: u16 = 0x0002;
    pub const HW_REQ_INFO: u16 = 0x0005;
    pub const HW_GET_INFO: u16 = 0x0006;
    pub const HW_START_UPDATEMSGS: u16 = 0x0011;
    pub const HW_STOP_UPDATEMSGS: u16 = 0x0012;
    pub const MOD_SET_CHANENABLESTATE: u16 = 0x0210;
    pub const MOT_REQ_POSCOUNTER: u16 = 0x0411;
    pub const MOT_GET_POSCOUNTER: u16 = 0x0412;
    pub const MOT_MOVE_HOME: u16 = 0x0443;
    pub const MOT_MOVE_HOMED: u16 = 0x0444;
    pub const MOT_MOVE_ABSOLUTE: u16 = 0x0453;
    pub const MOT_MOVE_COMPLETED: u16 = 0x0464;
    pub const MOT_REQ_DCSTATUSUPDATE: u16 = 0x0490;
    pub const MOT_GET_DCSTATUSUPDATE: u16 = 0x0491;
    pub const MOT_ACK_DCSTATUSUPDATE: u16 = 0x0492;
}

/// Source/destination byte of the host.
pub const HOST: u8 = 0x01;
/// Source/destination byte of a single-channel controller.
pub const CONTROLLER: u8 = 0x50;
/// Header length in bytes.
pub const HEADER_LEN: usize = 6;
/// Channel identifier of single-channel controllers.
pub const CHANNEL_1: u8 = 0x01;

const DATA_PACKET_FLAG: u8 = 0x80;

/// Status bit: moving forward.
pub const STATUS_MOVING_FORWARD: u32 = 0x0000_0010;
/// Status bit: moving in reverse.
pub const STATUS_MOVING_REVERSE: u32 = 0x0000_0020;
/// Status bit: homing in progress.
pub const STATUS_HOMING: u32 = 0x0000_0200;
/// Status bit: homed since power-up.
pub const STATUS_HOMED: u32 = 0x0000_0400;
/// Status bit: motor channel enabled.
pub const STATUS_CHANNEL_ENABLED: u32 = 0x8000_0000;

/// One APT message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AptMessage {
    /// Message id.
    pub id: u16,
    /// Header parameters of a short message, zero when `data` is present.
    pub params: [u8; 2],
    /// Data packet of a long message.
    pub data: Option<Bytes>,
    /// Destination byte without the data-packet flag.
    pub destination: u8,
    /// Source byte.
    pub source: u8,
}

impl AptMessage {
    /// Header-only message from the host to the controller.
    pub fn short(id: u16, param1: u8, param2: u8) -> Self {
        Self {
            id,
            params: [param1, param2],
            data: None,
            destination: CONTROLLER,
            source: HOST,
        }
    }

    /// Message with a data packet from the host to the controller.
    pub fn long(id: u16, data: Bytes) -> Self {
        Self {
            id,
            params: [0, 0],
            data: Some(data),
            destination: CONTROLLER,
            source: HOST,
        }
    }

    /// Same message addressed from the controller back to the host.
    pub fn from_controller(mut self) -> Self {
        self.destination = HOST;
        self.source = CONTROLLER;
        self
    }

    /// Serialize header and data.
    pub fn encode(&self) -> AppResult<Bytes> {
        let data_len = self.data.as_ref().map_or(0, |d| d.len());
        let mut buf = BytesMut::with_capacity(HEADER_LEN + data_len);
        buf.put_u16_le(self.id);
        match &self.data {
            Some(data) => {
                let len = u16::try_from(data.len()).map_err(|_| {
                    DeviceError::Validation(format!(
                        "APT data packet of {} bytes is too long",
                        data.len()
                    ))
                })?;
                buf.put_u16_le(len);
                buf.put_u8(self.destination | DATA_PACKET_FLAG);
                buf.put_u8(self.source);
                buf.put_slice(data);
            }
            None => {
                buf.put_slice(&self.params);
                buf.put_u8(self.destination);
                buf.put_u8(self.source);
            }
        }
        Ok(buf.freeze())
    }

    /// Length of the data packet announced by `header`, if any.
    pub fn data_len(header: &[u8]) -> Option<usize> {
        if header.len() < HEADER_LEN || header[4] & DATA_PACKET_FLAG == 0 {
            return None;
        }
        Some(u16::from_le_bytes([header[2], header[3]]) as usize)
    }

    /// Parse one complete message.
    pub fn decode(frame: &[u8]) -> AppResult<Self> {
        if frame.len() < HEADER_LEN {
            return Err(DeviceError::Apt(format!(
                "Message of {} bytes is shorter than the header",
                frame.len()
            )));
        }
        let mut buf = frame;
        let id = buf.get_u16_le();
        let params = [buf.get_u8(), buf.get_u8()];
        let destination = buf.get_u8();
        let source = buf.get_u8();
        if destination & DATA_PACKET_FLAG == 0 {
            return Ok(Self {
                id,
                params,
                data: None,
                destination,
                source,
            });
        }
        let len = u16::from_le_bytes(params) as usize;
        if buf.remaining() < len {
            return Err(DeviceError::Apt(format!(
                "Message 0x{:04X} announces {} data bytes but carries {}",
                id,
                len,
                buf.remaining()
            )));
        }
        Ok(Self {
            id,
            params: [0, 0],
            data: Some(Bytes::copy_from_slice(&buf[..len])),
            destination: destination & !DATA_PACKET_FLAG,
            source,
        })
    }

    fn payload(&self, min_len: usize) -> AppResult<&[u8]> {
        match &self.data {
            Some(data) if data.len() >= min_len => Ok(&data[..]),
            _ => Err(DeviceError::Apt(format!(
                "Message 0x{:04X} needs at least {} data bytes",
                self.id, min_len
            ))),
        }
    }
}

/// Data packet of `MOT_MOVE_ABSOLUTE` and `MOT_GET_POSCOUNTER`.
pub fn channel_position_data(channel: u8, counts: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u16_le(u16::from(channel));
    buf.put_i32_le(counts);
    buf.freeze()
}

/// Identity of a controller from `HW_GET_INFO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareInfo {
    /// Eight-digit serial number.
    pub serial_number: u32,
    /// Model name, e.g. `KDC101`.
    pub model: String,
    /// Hardware type.
    pub hardware_type: u16,
    /// Firmware version as major, interim, minor.
    pub firmware: (u8, u8, u8),
}

impl HardwareInfo {
    /// Parse the data packet of `HW_GET_INFO`.
    pub fn parse(message: &AptMessage) -> AppResult<Self> {
        let mut data = message.payload(18)?;
        let serial_number = data.get_u32_le();
        let model = String::from_utf8_lossy(&data[..8])
            .trim_end_matches('\0')
            .trim()
            .to_string();
        data.advance(8);
        let hardware_type = data.get_u16_le();
        let minor = data.get_u8();
        let interim = data.get_u8();
        let major = data.get_u8();
        Ok(Self {
            serial_number,
            model,
            hardware_type,
            firmware: (major, interim, minor),
        })
    }
}

/// DC servo status from `MOT_GET_DCSTATUSUPDATE` or `MOT_MOVE_COMPLETED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcStatus {
    /// Position in encoder counts.
    pub position: i32,
    /// Velocity in controller units.
    pub velocity: u16,
    /// Status bits.
    pub status_bits: u32,
}

impl DcStatus {
    /// Parse a 14-byte status packet.
    pub fn parse(message: &AptMessage) -> AppResult<Self> {
        let mut data = message.payload(14)?;
        let _channel = data.get_u16_le();
        let position = data.get_i32_le();
        let velocity = data.get_u16_le();
        let _reserved = data.get_u16_le();
        let status_bits = data.get_u32_le();
        Ok(Self {
            position,
            velocity,
            status_bits,
        })
    }

    /// Encode as a 14-byte status packet.
    pub fn encode(&self, channel: u8) -> Bytes {
        let mut buf = BytesMut::with_capacity(14);
        buf.put_u16_le(u16::from(channel));
        buf.put_i32_le(self.position);
        buf.put_u16_le(self.velocity);
        buf.put_u16_le(0);
        buf.put_u32_le(self.status_bits);
        buf.freeze()
    }

    /// Homed since power-up.
    pub fn is_homed(&self) -> bool {
        self.status_bits & STATUS_HOMED != 0
    }

    /// Moving or homing.
    pub fn is_moving(&self) -> bool {
        self.status_bits & (STATUS_MOVING_FORWARD | STATUS_MOVING_REVERSE | STATUS_HOMING) != 0
    }
}

/// Round a value in counts to the `i32` the controller accepts.
pub fn to_counts(value: f64) -> AppResult<i32> {
    let rounded = value.round();
    if !rounded.is_finite() || rounded < f64::from(i32::MIN) || rounded > f64::from(i32::MAX) {
        return Err(DeviceError::Validation(format!(
            "{} counts does not fit a 32-bit position",
            value
        )));
    }
    Ok(rounded as i32)
}

/// Connection to one single-channel APT controller.
pub struct AptController {
    transport: Box<dyn Transport>,
    channel: u8,
    timeout: Duration,
    updates_enabled: bool,
}

impl AptController {
    /// Open the transport (with retry).
    pub async fn connect(
        mut transport: Box<dyn Transport>,
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> AppResult<Self> {
        open_with_retry(transport.as_mut(), policy).await?;
        Ok(Self {
            transport,
            channel: CHANNEL_1,
            timeout,
            updates_enabled: false,
        })
    }

    /// Name of the underlying transport.
    pub fn name(&self) -> &str {
        self.transport.name()
    }

    /// Send one message.
    pub async fn send(&mut self, message: &AptMessage) -> AppResult<()> {
        let frame = message.encode()?;
        debug!(port = %self.transport.name(), id = message.id, "APT send");
        self.transport.write(&frame).await
    }

    async fn receive_within(&mut self, timeout: Duration) -> AppResult<AptMessage> {
        let header = self.transport.read_exact(HEADER_LEN, timeout).await?;
        match AptMessage::data_len(&header) {
            Some(len) => {
                let mut frame = header;
                frame.extend(self.transport.read_exact(len, timeout).await?);
                AptMessage::decode(&frame)
            }
            None => AptMessage::decode(&header),
        }
    }

    /// Receive the next message.
    pub async fn receive(&mut self) -> AppResult<AptMessage> {
        self.receive_within(self.timeout).await
    }

    /// Receive messages until one with `id` arrives.
    ///
    /// Unsolicited status updates are acknowledged and skipped, as are stale
    /// replies left over from earlier requests.
    pub async fn read_until_id(&mut self, id: u16, timeout: Duration) -> AppResult<AptMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DeviceError::Timeout(format!(
                    "No APT message 0x{:04X} from {} within {:?}",
                    id,
                    self.transport.name(),
                    timeout
                )));
            }
            let message = self.receive_within(remaining).await?;
            if message.id == id {
                return Ok(message);
            }
            if message.id == ids::MOT_GET_DCSTATUSUPDATE && self.updates_enabled {
                self.send(&AptMessage::short(ids::MOT_ACK_DCSTATUSUPDATE, 0, 0))
                    .await?;
            }
            debug!(expected = id, received = message.id, "Skipping APT message");
        }
    }

    /// Request and parse the controller identity.
    pub async fn hardware_info(&mut self) -> AppResult<HardwareInfo> {
        self.send(&AptMessage::short(ids::HW_REQ_INFO, 0, 0)).await?;
        let reply = self.read_until_id(ids::HW_GET_INFO, self.timeout).await?;
        HardwareInfo::parse(&reply)
    }

    /// Enable the motor channel. Moves are ignored while it is disabled.
    pub async fn enable_channel(&mut self) -> AppResult<()> {
        self.send(&AptMessage::short(
            ids::MOD_SET_CHANENABLESTATE,
            self.channel,
            0x01,
        ))
        .await
    }

    /// Ask the controller to push status updates.
    pub async fn start_update_messages(&mut self) -> AppResult<()> {
        self.send(&AptMessage::short(ids::HW_START_UPDATEMSGS, 0, 0))
            .await?;
        self.updates_enabled = true;
        Ok(())
    }

    /// Stop pushed status updates.
    pub async fn stop_update_messages(&mut self) -> AppResult<()> {
        self.send(&AptMessage::short(ids::HW_STOP_UPDATEMSGS, 0, 0))
            .await?;
        self.updates_enabled = false;
        Ok(())
    }

    /// Current status.
    pub async fn status(&mut self) -> AppResult<DcStatus> {
        self.send(&AptMessage::short(ids::MOT_REQ_DCSTATUSUPDATE, self.channel, 0))
            .await?;
        let reply = self
            .read_until_id(ids::MOT_GET_DCSTATUSUPDATE, self.timeout)
            .await?;
        DcStatus::parse(&reply)
    }

    /// Whether the stage has been homed since power-up.
    pub async fn is_homed(&mut self) -> AppResult<bool> {
        Ok(self.status().await?.is_homed())
    }

    /// Home and wait for completion.
    pub async fn home(&mut self, timeout: Duration) -> AppResult<()> {
        info!(port = %self.transport.name(), "Homing");
        self.send(&AptMessage::short(ids::MOT_MOVE_HOME, self.channel, 0))
            .await?;
        self.read_until_id(ids::MOT_MOVE_HOMED, timeout).await?;
        info!(port = %self.transport.name(), "Homed");
        Ok(())
    }

    /// Command an absolute move without waiting.
    pub async fn start_move_absolute(&mut self, counts: i32) -> AppResult<()> {
        self.send(&AptMessage::long(
            ids::MOT_MOVE_ABSOLUTE,
            channel_position_data(self.channel, counts),
        ))
        .await
    }

    /// Move and wait for `MOT_MOVE_COMPLETED`. Returns the reported position.
    pub async fn move_absolute(&mut self, counts: i32, timeout: Duration) -> AppResult<i32> {
        self.start_move_absolute(counts).await?;
        let completed = self
            .read_until_id(ids::MOT_MOVE_COMPLETED, timeout)
            .await?;
        Ok(DcStatus::parse(&completed)?.position)
    }

    /// Position counter in encoder counts.
    pub async fn position(&mut self) -> AppResult<i32> {
        self.send(&AptMessage::short(ids::MOT_REQ_POSCOUNTER, self.channel, 0))
            .await?;
        let reply = self
            .read_until_id(ids::MOT_GET_POSCOUNTER, self.timeout)
            .await?;
        let mut data = reply.payload(6)?;
        let _channel = data.get_u16_le();
        Ok(data.get_i32_le())
    }

    /// Stop update messages, tell the controller we leave, close the port.
    pub async fn close(&mut self) -> AppResult<()> {
        if self.updates_enabled {
            self.stop_update_messages().await?;
        }
        self.send(&AptMessage::short(ids::HW_DISCONNECT, 0, 0)).await?;
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_header_layout() {
        let frame = AptMessage::short(ids::MOD_SET_CHANENABLESTATE, 0x01, 0x01)
            .encode()
            .unwrap();
        assert_eq!(&frame[..], &[0x10, 0x02, 0x01, 0x01, 0x50, 0x01]);
        assert_eq!(AptMessage::data_len(&frame), None);
    }

    #[test]
    fn test_long_header_layout() {
        let frame = AptMessage::long(ids::MOT_MOVE_ABSOLUTE, channel_position_data(1, -2))
            .encode()
            .unwrap();
        assert_eq!(
            &frame[..],
            &[0x53, 0x04, 0x06, 0x00, 0xD0, 0x01, 0x01, 0x00, 0xFE, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(AptMessage::data_len(&frame[..HEADER_LEN]), Some(6));

        let decoded = AptMessage::decode(&frame).unwrap();
        assert_eq!(decoded.destination, CONTROLLER);
        assert_eq!(decoded.data.as_deref(), Some(&frame[6..]));
    }

    #[test]
    fn test_truncated_data_rejected() {
        let frame = AptMessage::long(ids::MOT_MOVE_ABSOLUTE, channel_position_data(1, 5))
            .encode()
            .unwrap();
        assert!(AptMessage::decode(&frame[..9]).is_err());
        assert!(AptMessage::decode(&frame[..4]).is_err());
    }

    #[test]
    fn test_dc_status_bits() {
        let status = DcStatus {
            position: 1234,
            velocity: 0,
            status_bits: STATUS_HOMED | STATUS_CHANNEL_ENABLED,
        };
        let message =
            AptMessage::long(ids::MOT_GET_DCSTATUSUPDATE, status.encode(CHANNEL_1)).from_controller();
        let parsed = DcStatus::parse(&message).unwrap();
        assert_eq!(parsed, status);
        assert!(parsed.is_homed());
        assert!(!parsed.is_moving());
    }

    #[test]
    fn test_to_counts() {
        assert_eq!(to_counts(10.5).unwrap(), 11);
        assert_eq!(to_counts(-0.4).unwrap(), 0);
        assert!(to_counts(3e9).is_err());
        assert!(to_counts(f64::NAN).is_err());
    }
}
