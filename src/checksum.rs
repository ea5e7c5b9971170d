//! Integrity tokens of command reports and staged images.

use crc::{CRC_8_MAXIM_DOW, CRC_16_MODBUS, Crc};

/// 1-Wire CRC-8 (`x^8 + x^5 + x^4 + 1`, reflected, initial value 0).
pub const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_MAXIM_DOW);

/// CRC-16 with reflected polynomial 0xA001 and initial value 0xFFFF.
pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Width of the integrity token carried in every report.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Integrity {
    None,
    Crc8,
    Crc16,
}

impl Integrity {
    /// Bytes the token occupies in a report.
    pub const fn width(self) -> usize {
        match self {
            Integrity::None => 0,
            Integrity::Crc8 => 1,
            Integrity::Crc16 => 2,
        }
    }

    /// Token over the concatenation of `parts`.
    pub fn compute(self, parts: &[&[u8]]) -> u16 {
        match self {
            Integrity::None => 0,
            Integrity::Crc8 => {
                let mut digest = CRC8.digest();
                parts.iter().for_each(|part| digest.update(part));
                u16::from(digest.finalize())
            }
            Integrity::Crc16 => {
                let mut digest = CRC16.digest();
                parts.iter().for_each(|part| digest.update(part));
                digest.finalize()
            }
        }
    }

    /// Read a token of this width (little-endian) from `bytes`.
    pub fn read(self, bytes: &[u8]) -> u16 {
        match self {
            Integrity::None => 0,
            Integrity::Crc8 => u16::from(bytes[0]),
            Integrity::Crc16 => u16::from_le_bytes([bytes[0], bytes[1]]),
        }
    }

    /// Store a token of this width (little-endian) into `bytes`.
    pub fn write(self, token: u16, bytes: &mut [u8]) {
        let token = token.to_le_bytes();
        bytes[..self.width()].copy_from_slice(&token[..self.width()]);
    }
}
