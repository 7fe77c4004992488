//! Simulated Elliptec interface board.

use crate::devices::elliptec::codec::{address_char, decode_counts, encode_counts, POSITION_BITS};
use crate::hardware::mock::SimulatedDevice;
use std::collections::BTreeMap;

/// Serial number reported by every simulated module.
pub const MOCK_SERIAL_NUMBER: &str = "12345678";

/// One simulated module.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedModule {
    /// Serial number in the `IN` reply.
    pub serial_number: String,
    /// Motor type in the `IN` reply.
    pub motor_type: String,
    /// Current position in counts.
    pub position: i64,
    /// Status code returned by `gs` and by failing moves.
    pub status: u32,
    /// Number of `ma` commands received.
    pub absolute_moves: usize,
    /// Number of `ho` commands received.
    pub homes: usize,
}

impl SimulatedModule {
    /// ELL14 at position 0.
    pub fn ell14() -> Self {
        Self {
            serial_number: MOCK_SERIAL_NUMBER.to_string(),
            motor_type: "0E".to_string(),
            position: 0,
            status: 0,
            absolute_moves: 0,
            homes: 0,
        }
    }
}

/// Elliptec bus with modules at chosen addresses.
///
/// Addresses without a module stay silent, like on the real bus.
#[derive(Debug, Default)]
pub struct SimulatedElliptecBus {
    modules: BTreeMap<u8, SimulatedModule>,
    pending: Vec<u8>,
}

impl SimulatedElliptecBus {
    /// ELL14 modules at each of `addresses`.
    pub fn with_addresses(addresses: impl IntoIterator<Item = u8>) -> Self {
        Self {
            modules: addresses
                .into_iter()
                .map(|a| (a, SimulatedModule::ell14()))
                .collect(),
            pending: Vec::new(),
        }
    }

    /// Module at `address`.
    pub fn module(&self, address: u8) -> Option<&SimulatedModule> {
        self.modules.get(&address)
    }

    /// Mutable module at `address`.
    pub fn module_mut(&mut self, address: u8) -> Option<&mut SimulatedModule> {
        self.modules.get_mut(&address)
    }

    fn handle_frame(&mut self, frame: &str) -> Option<String> {
        if frame.len() < 3 || !frame.is_ascii() {
            return None;
        }
        let address = u8::from_str_radix(&frame[0..1], 16).ok()?;
        let prefix = address_char(address).ok()?;
        let module = self.modules.get_mut(&address)?;
        let payload = &frame[3..];

        let position_reply = |m: &SimulatedModule| {
            encode_counts(m.position, POSITION_BITS)
                .ok()
                .map(|hex| format!("{}PO{}", prefix, hex))
        };

        match &frame[1..3] {
            "in" => Some(format!(
                "{}IN{}{}20230101001F00023000",
                prefix, module.motor_type, module.serial_number
            )),
            "gs" => Some(format!("{}GS{:02X}", prefix, module.status)),
            "gp" => position_reply(module),
            "ho" => {
                module.homes += 1;
                module.position = 0;
                position_reply(module)
            }
            "ma" => {
                module.absolute_moves += 1;
                if module.status != 0 {
                    return Some(format!("{}GS{:02X}", prefix, module.status));
                }
                module.position = decode_counts(payload, Some(POSITION_BITS)).ok()?;
                position_reply(module)
            }
            "mr" => {
                let offset = decode_counts(payload, Some(POSITION_BITS)).ok()?;
                module.position += offset;
                position_reply(module)
            }
            _ => Some(format!("{}GS03", prefix)),
        }
    }
}

impl SimulatedDevice for SimulatedElliptecBus {
    fn on_write(&mut self, data: &[u8]) -> Vec<u8> {
        // A bare CR resets every module's receiver
        if data == b"\r" {
            self.pending.clear();
            return Vec::new();
        }
        self.pending.extend_from_slice(data);
        let frame = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        match self.handle_frame(frame.trim()) {
            Some(reply) => format!("{}\r\n", reply).into_bytes(),
            None => Vec::new(),
        }
    }
}
