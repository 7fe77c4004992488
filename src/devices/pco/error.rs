//! PCO SDK return codes.

use std::fmt;
use thiserror::Error;

/// `PCO_WaitforBuffer` gave up before the buffer was filled.
pub const TIMEOUT: i32 = 0xA00A_3005_u32 as i32;

/// `PCO_OpenCamera` found no further camera.
pub const NO_MORE_CAMERAS: i32 = 0x800A_300D_u32 as i32;

/// Non-zero return code of a PCO SDK call.
///
/// Without the SDK's own text lookup the code is shown in hex together with
/// the masked value to search for in `PCO_errt.h`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcoError {
    /// Raw SDK return code.
    pub return_code: i32,
}

impl PcoError {
    /// Error for `return_code`.
    pub fn new(return_code: i32) -> Self {
        Self { return_code }
    }

    /// Buffer wait timed out.
    pub fn is_timeout(&self) -> bool {
        self.return_code == TIMEOUT
    }

    /// Code as it appears in `PCO_errt.h`.
    ///
    /// Common errors (leading `0xA`) keep the top 4 and bottom 8 bits, all
    /// others keep the top 4 and bottom 16 bits.
    pub fn masked_code(&self) -> i32 {
        let mask: u32 = if return_code_to_hex_string(self.return_code).starts_with("0xA") {
            0xF000_00FF
        } else {
            0xF000_FFFF
        };
        self.return_code & mask as i32
    }
}

impl fmt::Display for PcoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PCO Error code: {}, Look for {} in PCO_errt.h",
            return_code_to_hex_string(self.return_code),
            return_code_to_hex_string(self.masked_code())
        )
    }
}

/// `0x`-prefixed, upper-case, 8-digit two's-complement hex.
pub fn return_code_to_hex_string(return_code: i32) -> String {
    format!("0x{:08X}", return_code as u32)
}
