//! Simulated K-Cube DC servo controller speaking APT.

use crate::devices::apt::{
    channel_position_data, ids, AptMessage, DcStatus, CHANNEL_1, STATUS_CHANNEL_ENABLED,
    STATUS_HOMED,
};
use crate::hardware::mock::SimulatedDevice;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Single-channel K-Cube.
///
/// Moves complete instantly unless `stalled` is set, in which case the
/// position never changes and no `MOT_MOVE_COMPLETED` is sent. Moves are
/// ignored while the channel is disabled, as on the real controller.
#[derive(Debug, Clone)]
pub struct SimulatedKCube {
    /// Serial number in `HW_GET_INFO`.
    pub serial_number: u32,
    /// Model name in `HW_GET_INFO`.
    pub model: String,
    /// Position in encoder counts.
    pub position: i32,
    /// Homed since power-up.
    pub homed: bool,
    /// Motor channel enabled.
    pub channel_enabled: bool,
    /// Pushing status updates.
    pub updates_enabled: bool,
    /// Moves are accepted but never finish.
    pub stalled: bool,
    /// Absolute moves received.
    pub moves: usize,
    /// Home commands received.
    pub homes: usize,
    /// Status update acknowledgements received.
    pub acks: usize,
    /// `HW_DISCONNECT` received.
    pub disconnected: bool,
}

impl SimulatedKCube {
    /// Unhomed KDC101 at position 0.
    pub fn new(serial_number: u32) -> Self {
        Self {
            serial_number,
            model: "KDC101".to_string(),
            position: 0,
            homed: false,
            channel_enabled: false,
            updates_enabled: false,
            stalled: false,
            moves: 0,
            homes: 0,
            acks: 0,
            disconnected: false,
        }
    }

    fn status(&self) -> DcStatus {
        let mut status_bits = 0;
        if self.homed {
            status_bits |= STATUS_HOMED;
        }
        if self.channel_enabled {
            status_bits |= STATUS_CHANNEL_ENABLED;
        }
        DcStatus {
            position: self.position,
            velocity: 0,
            status_bits,
        }
    }

    fn hardware_info(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(84);
        buf.put_u32_le(self.serial_number);
        let mut model = [0u8; 8];
        for (slot, byte) in model.iter_mut().zip(self.model.bytes()) {
            *slot = byte;
        }
        buf.put_slice(&model);
        buf.put_u16_le(16);
        buf.put_slice(&[0, 0, 3, 0]);
        buf.resize(84, 0);
        buf.freeze()
    }

    fn reply(&mut self, request: &AptMessage) -> Option<AptMessage> {
        let reply = match request.id {
            ids::HW_REQ_INFO => AptMessage::long(ids::HW_GET_INFO, self.hardware_info()),
            ids::MOD_SET_CHANENABLESTATE => {
                self.channel_enabled = request.params[1] == 0x01;
                return None;
            }
            ids::HW_START_UPDATEMSGS => {
                self.updates_enabled = true;
                return None;
            }
            ids::HW_STOP_UPDATEMSGS => {
                self.updates_enabled = false;
                return None;
            }
            ids::HW_DISCONNECT => {
                self.disconnected = true;
                return None;
            }
            ids::MOT_ACK_DCSTATUSUPDATE => {
                self.acks += 1;
                return None;
            }
            ids::MOT_REQ_DCSTATUSUPDATE => {
                AptMessage::long(ids::MOT_GET_DCSTATUSUPDATE, self.status().encode(CHANNEL_1))
            }
            ids::MOT_REQ_POSCOUNTER => AptMessage::long(
                ids::MOT_GET_POSCOUNTER,
                channel_position_data(CHANNEL_1, self.position),
            ),
            ids::MOT_MOVE_HOME => {
                self.homes += 1;
                self.homed = true;
                self.position = 0;
                AptMessage::short(ids::MOT_MOVE_HOMED, CHANNEL_1, 0)
            }
            ids::MOT_MOVE_ABSOLUTE => {
                let mut data = request.data.clone()?;
                if data.len() < 6 || !self.channel_enabled {
                    return None;
                }
                let _channel = data.get_u16_le();
                let target = data.get_i32_le();
                self.moves += 1;
                if self.stalled {
                    return None;
                }
                self.position = target;
                AptMessage::long(ids::MOT_MOVE_COMPLETED, self.status().encode(CHANNEL_1))
            }
            _ => return None,
        };
        Some(reply.from_controller())
    }
}

impl SimulatedDevice for SimulatedKCube {
    fn on_write(&mut self, data: &[u8]) -> Vec<u8> {
        let Ok(request) = AptMessage::decode(data) else {
            return Vec::new();
        };
        let Some(reply) = self.reply(&request) else {
            return Vec::new();
        };
        let mut output = Vec::new();
        // A pushed status update tends to arrive ahead of the reply
        if self.updates_enabled {
            let update =
                AptMessage::long(ids::MOT_GET_DCSTATUSUPDATE, self.status().encode(CHANNEL_1))
                    .from_controller();
            if let Ok(frame) = update.encode() {
                output.extend_from_slice(&frame);
            }
        }
        if let Ok(frame) = reply.encode() {
            output.extend_from_slice(&frame);
        }
        output
    }
}
