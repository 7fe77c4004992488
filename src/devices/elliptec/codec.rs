//! Elliptec ASCII frame codec.
//!
//! Frame format: `[Address][Command][Data]`
//! - Address: one hex digit, `0`-`F`
//! - Command: two letters, lower case from host, upper case in replies
//! - Data: positions and offsets as two's-complement hex, 8 digits for 32 bits
//!
//! Replies are terminated by `\r\n`.

use crate::devices::elliptec::ElliptecError;
use crate::error::{AppResult, DeviceError};

/// Width used for positions and relative moves on the bus.
pub const POSITION_BITS: u32 = 32;

/// Highest bus address.
pub const MAX_ADDRESS: u8 = 0xF;

/// Encode signed encoder counts as two's-complement upper-case hex.
///
/// The result is zero-padded to `n_bits / 4` digits. Values that do not fit in
/// `n_bits` signed bits are rejected.
pub fn encode_counts(counts: i64, n_bits: u32) -> AppResult<String> {
    if n_bits == 0 || n_bits > 64 || n_bits % 4 != 0 {
        return Err(DeviceError::Validation(format!(
            "Unsupported word width of {} bits",
            n_bits
        )));
    }
    let modulus = 1i128 << n_bits;
    let min = -(modulus / 2);
    let max = modulus / 2 - 1;
    let value = i128::from(counts);
    if value < min || value > max {
        return Err(DeviceError::Validation(format!(
            "{} counts does not fit in a signed {}-bit word",
            counts, n_bits
        )));
    }
    let unsigned = if value < 0 { value + modulus } else { value };
    Ok(format!(
        "{:0width$X}",
        unsigned,
        width = (n_bits / 4) as usize
    ))
}

/// Decode two's-complement hex into signed counts.
///
/// `n_bits` defaults to four bits per hex digit. An empty payload decodes as
/// zero, which the ELL14 sends for position 0 on some firmware.
pub fn decode_counts(text: &str, n_bits: Option<u32>) -> AppResult<i64> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }
    let n_bits = n_bits.unwrap_or(4 * text.len() as u32);
    if n_bits == 0 || n_bits > 64 {
        return Err(DeviceError::Validation(format!(
            "Unsupported word width of {} bits",
            n_bits
        )));
    }
    let raw = u64::from_str_radix(text, 16)
        .map_err(|e| DeviceError::Instrument(format!("Invalid hex payload '{}': {}", text, e)))?;
    let raw = i128::from(raw);
    let modulus = 1i128 << n_bits;
    if raw >= modulus {
        return Err(DeviceError::Instrument(format!(
            "Hex payload '{}' wider than {} bits",
            text, n_bits
        )));
    }
    let value = if raw >= modulus / 2 { raw - modulus } else { raw };
    i64::try_from(value)
        .map_err(|_| DeviceError::Instrument(format!("Hex payload '{}' out of range", text)))
}

/// Hex digit for a bus address.
pub fn address_char(address: u8) -> AppResult<char> {
    if address > MAX_ADDRESS {
        return Err(DeviceError::Validation(format!(
            "Elliptec address {} is outside 0-F",
            address
        )));
    }
    char::from_digit(u32::from(address), 16)
        .map(|c| c.to_ascii_uppercase())
        .ok_or_else(|| DeviceError::Validation(format!("Invalid Elliptec address {}", address)))
}

/// Parse a connection name such as `"0"` or `"a"` into a bus address.
pub fn parse_address(connection: &str) -> AppResult<u8> {
    let trimmed = connection.trim();
    if trimmed.len() != 1 {
        return Err(DeviceError::Validation(format!(
            "Elliptec connection '{}' must be a single hex digit",
            connection
        )));
    }
    u8::from_str_radix(trimmed, 16).map_err(|_| {
        DeviceError::Validation(format!(
            "Elliptec connection '{}' must be a single hex digit",
            connection
        ))
    })
}

/// Build a host-to-device frame, without line termination.
pub fn frame(address: u8, command: &str, payload: &str) -> AppResult<String> {
    Ok(format!("{}{}{}", address_char(address)?, command, payload))
}

/// One reply from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Address that answered.
    pub address: u8,
    /// Two-letter reply command, e.g. `PO`, `GS`, `IN`.
    pub command: String,
    /// Everything after the command.
    pub data: String,
}

impl Reply {
    /// Parse a reply line with its terminator already removed.
    pub fn parse(line: &str) -> AppResult<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() < 3 || !line.is_ascii() {
            return Err(DeviceError::Instrument(format!(
                "Malformed Elliptec reply '{}'",
                line
            )));
        }
        let address = parse_address(&line[0..1]).map_err(|_| {
            DeviceError::Instrument(format!("Malformed Elliptec reply address in '{}'", line))
        })?;
        Ok(Self {
            address,
            command: line[1..3].to_string(),
            data: line[3..].to_string(),
        })
    }

    /// Status code carried by a `GS` reply.
    pub fn status_code(&self) -> AppResult<u32> {
        u32::from_str_radix(self.data.trim(), 16).map_err(|_| {
            DeviceError::Instrument(format!("Invalid status payload '{}'", self.data))
        })
    }

    /// Treat a `GS` reply with a non-zero code as an error.
    ///
    /// Motion commands answer with `GS` instead of `PO` when they fail.
    pub fn into_result(self) -> AppResult<Self> {
        if self.command.eq_ignore_ascii_case("GS") {
            let code = self.status_code()?;
            if code != 0 {
                return Err(DeviceError::Elliptec {
                    address: self.address,
                    source: ElliptecError::new(code),
                });
            }
        }
        Ok(self)
    }
}

/// Decoded `IN` reply.
///
/// Layout after the `IN` command: motor type (2), serial number (8),
/// year (4), firmware (2), hardware (2), travel (4), pulses per unit (8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Motor type, e.g. `0E` for the ELL14.
    pub motor_type: String,
    /// Eight-digit serial number.
    pub serial_number: String,
    /// Year of manufacture.
    pub year: String,
    /// Firmware release.
    pub firmware: String,
    /// Hardware release.
    pub hardware: String,
    /// Travel in mm or degrees, hex.
    pub travel: String,
    /// Pulses per measurement unit, hex.
    pub pulses_per_unit: String,
}

impl DeviceInfo {
    /// Parse the full reply line, address and command included.
    pub fn parse(info: &str) -> AppResult<Self> {
        let field = |range: std::ops::Range<usize>| -> AppResult<String> {
            info.get(range.clone()).map(str::to_string).ok_or_else(|| {
                DeviceError::Instrument(format!(
                    "Elliptec info string '{}' is too short for field {:?}",
                    info, range
                ))
            })
        };
        Ok(Self {
            motor_type: field(3..5)?,
            serial_number: field(5..13)?,
            year: field(13..17)?,
            firmware: field(17..19)?,
            hardware: field(19..21)?,
            travel: info.get(21..25).unwrap_or_default().to_string(),
            pulses_per_unit: info.get(25..33).unwrap_or_default().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_positive_and_negative() {
        assert_eq!(encode_counts(0, 32).unwrap(), "00000000");
        assert_eq!(encode_counts(0x8C00, 32).unwrap(), "00008C00");
        assert_eq!(encode_counts(-1, 32).unwrap(), "FFFFFFFF");
        assert_eq!(encode_counts(-0x8C00, 32).unwrap(), "FFFF7400");
    }

    #[test]
    fn test_signed_32_bit_boundaries() {
        let min = i64::from(i32::MIN);
        let max = i64::from(i32::MAX);
        assert_eq!(encode_counts(min, 32).unwrap(), "80000000");
        assert_eq!(encode_counts(max, 32).unwrap(), "7FFFFFFF");
        assert_eq!(decode_counts("80000000", None).unwrap(), min);
        assert_eq!(decode_counts("7FFFFFFF", None).unwrap(), max);
        assert!(encode_counts(max + 1, 32).is_err());
        assert!(encode_counts(min - 1, 32).is_err());
    }

    #[test]
    fn test_round_trip_sample_of_i32() {
        let mut value = i64::from(i32::MIN);
        while value < i64::from(i32::MAX) - 7_919_993 {
            let hex = encode_counts(value, 32).unwrap();
            assert_eq!(decode_counts(&hex, None).unwrap(), value);
            value += 7_919_993;
        }
        for value in [-2i64, -1, 0, 1, 2, 143_360, -143_360] {
            let hex = encode_counts(value, 32).unwrap();
            assert_eq!(decode_counts(&hex, Some(32)).unwrap(), value);
        }
    }

    #[test]
    fn test_decode_width_follows_text_length() {
        // Short payloads are interpreted with four bits per digit
        assert_eq!(decode_counts("F", None).unwrap(), -1);
        assert_eq!(decode_counts("F", Some(8)).unwrap(), 15);
        assert_eq!(decode_counts("", None).unwrap(), 0);
        assert!(decode_counts("XYZ", None).is_err());
    }

    #[test]
    fn test_address_parsing() {
        assert_eq!(parse_address("0").unwrap(), 0);
        assert_eq!(parse_address("a").unwrap(), 10);
        assert_eq!(parse_address("F").unwrap(), 15);
        assert!(parse_address("10").is_err());
        assert!(parse_address("G").is_err());
        assert_eq!(frame(10, "gp", "").unwrap(), "Agp");
    }

    #[test]
    fn test_reply_parse_and_status() {
        let reply = Reply::parse("2PO00001000").unwrap();
        assert_eq!(reply.address, 2);
        assert_eq!(reply.command, "PO");
        assert_eq!(reply.data, "00001000");

        let error = Reply::parse("0GS02").unwrap().into_result().unwrap_err();
        assert!(error.to_string().contains("Mechanical time out."));
        assert!(Reply::parse("0GS00").unwrap().into_result().is_ok());
        assert!(Reply::parse("0G").is_err());
    }

    #[test]
    fn test_device_info_serial_slice() {
        let info = DeviceInfo::parse("0IN0E1140012320220117001F00023000").unwrap();
        assert_eq!(info.motor_type, "0E");
        assert_eq!(info.serial_number, "11400123");
        assert_eq!(info.year, "2022");
        assert!(DeviceInfo::parse("0IN0E").is_err());
    }
}
