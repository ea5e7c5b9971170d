//! Command reports exchanged with the host.
//!
//! Every transaction carries one fixed-size report: an opcode, an integrity token and
//! one page of payload. Where these live inside the report is a build-time choice
//! described by [`ReportLayout`].

use crate::{Address, Error, checksum::Integrity};

pub mod session;

pub use session::{Session, State};

bitflags::bitflags! {
    /// Operations requested by a report. Flags combine and execute in a fixed order.
    ///
    /// The empty set requests reading: it rewinds the read cursor.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Opcode: u8 {
        const WRITE = 0x10;
        const ERASE = 0x20;
        const ERASE_STORE = 0x40;
        const LEAVE = 0x80;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Opcode {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Opcode({=u8:#x})", self.bits())
    }
}

impl Opcode {
    pub const READ: Opcode = Opcode::empty();
}

/// HID class request fetching a report from the device.
pub const GET_REPORT: u8 = 0x01;
/// HID class request sending a report to the device.
pub const SET_REPORT: u8 = 0x09;

const REQUEST_TYPE_MASK: u8 = 0x60;
const REQUEST_TYPE_CLASS: u8 = 0x20;

/// Control request as handed over by the transport driver.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupRequest {
    pub fn parse(raw: &[u8; 8]) -> Self {
        Self {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    /// Class request with the given request code, as a host would send it.
    pub const fn class(request: u8, length: u16) -> Self {
        Self {
            request_type: REQUEST_TYPE_CLASS | 0x01,
            request,
            value: 0x0300,
            index: 0,
            length,
        }
    }

    pub const fn is_class(&self) -> bool {
        self.request_type & REQUEST_TYPE_MASK == REQUEST_TYPE_CLASS
    }
}

/// Answer to a setup request.
#[derive(PartialEq, Eq, Debug)]
pub enum SetupResponse<'a> {
    /// Nothing to transfer.
    NoData,
    /// Data follows from the host in chunks.
    Receive,
    /// Send these bytes back to the host.
    Reply(&'a [u8]),
}

/// Answer to one chunk of host data.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChunkStatus {
    /// More chunks expected.
    Continue,
    /// The report is complete and was accepted.
    Complete,
    /// The report was rejected; the host should retry.
    Error,
}

/// Named offsets of the fields within a report.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReportLayout {
    pub command: usize,
    pub checksum: usize,
    pub integrity: Integrity,
    /// Byte holding the bitwise complement of the opcode.
    pub complement: Option<usize>,
    /// Two-byte little-endian target address of a write.
    pub address: Option<usize>,
    /// Start of the page payload.
    pub data: usize,
}

impl ReportLayout {
    /// Opcode, CRC-8 and payload; writes go to consecutive pages.
    pub const fn reduced() -> Self {
        Self {
            command: 0,
            checksum: 1,
            integrity: Integrity::Crc8,
            complement: None,
            address: None,
            data: 2,
        }
    }

    /// Opcode, CRC-16, opcode complement and payload.
    pub const fn canonical() -> Self {
        Self {
            command: 0,
            checksum: 1,
            integrity: Integrity::Crc16,
            complement: Some(3),
            address: None,
            data: 4,
        }
    }

    /// Canonical layout with an explicit target address in front of the payload.
    pub const fn addressed() -> Self {
        Self {
            address: Some(4),
            data: 6,
            ..Self::canonical()
        }
    }

    /// Full report length for the given page size.
    pub const fn len(&self, page_size: u16) -> usize {
        self.data + page_size as usize
    }

    /// Check that no two fields overlap and the payload comes last.
    pub fn validate(&self) -> Result<(), Error> {
        let mut fields: [(usize, usize); 4] = [(0, 0); 4];
        fields[0] = (self.command, 1);
        fields[1] = (self.checksum, self.integrity.width());
        fields[2] = self.complement.map_or((0, 0), |at| (at, 1));
        fields[3] = self.address.map_or((0, 0), |at| (at, 2));

        for (i, &(start, len)) in fields.iter().enumerate() {
            if len == 0 {
                continue;
            }
            if start + len > self.data {
                return Err(Error::InvalidConfig);
            }
            let overlaps = fields[i + 1..]
                .iter()
                .filter(|(_, other_len)| *other_len != 0)
                .any(|&(other, other_len)| start < other + other_len && other < start + len);
            if overlaps {
                return Err(Error::InvalidConfig);
            }
        }
        Ok(())
    }

    /// Integrity token over everything in `report` except the token itself.
    pub fn token(&self, report: &[u8]) -> u16 {
        let end = self.checksum + self.integrity.width();
        self.integrity
            .compute(&[&report[..self.checksum], &report[end..]])
    }

    /// Parse and verify a complete report.
    pub fn parse(&self, report: &[u8]) -> Result<Command, Error> {
        let stored = self.integrity.read(&report[self.checksum..]);
        if stored != self.token(report) {
            return Err(Error::IntegrityMismatch);
        }

        let raw = report[self.command];
        if let Some(at) = self.complement {
            if report[at] != !raw {
                return Err(Error::IntegrityMismatch);
            }
        }

        let opcode = Opcode::from_bits(raw).ok_or(Error::Unsupported)?;
        let address = self
            .address
            .map(|at| Address::from(u16::from_le_bytes([report[at], report[at + 1]])));

        Ok(Command { opcode, address })
    }

    /// Fill in opcode, complement, address and token around a payload already in place.
    pub fn seal(&self, opcode: Opcode, address: Option<Address>, report: &mut [u8]) {
        report[self.command] = opcode.bits();
        if let Some(at) = self.complement {
            report[at] = !opcode.bits();
        }
        if let (Some(at), Some(address)) = (self.address, address) {
            report[at..at + 2].copy_from_slice(&(address as u16).to_le_bytes());
        }
        let token = self.token(report);
        self.integrity.write(token, &mut report[self.checksum..]);
    }
}

/// A validated command waiting for execution.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Command {
    pub opcode: Opcode,
    /// Explicit write target, when the layout carries one.
    pub address: Option<Address>,
}
