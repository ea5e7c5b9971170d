//! Host side of the protocol: report encoding and upload planning.
//!
//! Nothing here runs on the device; it exists so that host tools and tests build reports
//! exactly the way the updater parses them.

use crate::{
    Address, Error,
    checksum::CRC16,
    config::Config,
    flash::Geometry,
    protocol::{Opcode, ReportLayout},
    reloader::{Descriptor, ReloaderLayout},
};

/// Builds and verifies command reports for one layout and page size.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Encoder {
    layout: ReportLayout,
    page_size: u16,
}

/// Page returned by a report read.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ReadPage<'r> {
    /// Where the page was read from, when the layout carries an address.
    pub address: Option<Address>,
    pub data: &'r [u8],
}

impl Encoder {
    pub const fn new(layout: ReportLayout, page_size: u16) -> Self {
        Self { layout, page_size }
    }

    pub const fn for_config(config: &Config) -> Self {
        Self::new(config.layout, config.geometry.page_size)
    }

    pub const fn report_len(&self) -> usize {
        self.layout.len(self.page_size)
    }

    /// Encode one command into `report`, returning the report length.
    ///
    /// A short payload is padded with erased bytes. `address` is dropped by layouts without
    /// an address field, where the device writes consecutive pages instead.
    pub fn encode(
        &self,
        opcode: Opcode,
        address: Option<Address>,
        payload: &[u8],
        report: &mut [u8],
    ) -> Result<usize, Error> {
        let len = self.report_len();
        if report.len() < len || payload.len() > usize::from(self.page_size) {
            return Err(Error::OutOfBounds);
        }

        let report = &mut report[..len];
        report.fill(0);
        let data = &mut report[self.layout.data..];
        data[..payload.len()].copy_from_slice(payload);
        data[payload.len()..].fill(0xff);

        self.layout.seal(opcode, address, report);
        Ok(len)
    }

    /// Verify a report fetched from the device and extract the page it carries.
    pub fn decode_read<'r>(&self, report: &'r [u8]) -> Result<ReadPage<'r>, Error> {
        let report = report.get(..self.report_len()).ok_or(Error::OutOfBounds)?;
        let command = self.layout.parse(report)?;
        if command.opcode != Opcode::READ {
            return Err(Error::Unsupported);
        }
        Ok(ReadPage {
            address: command.address,
            data: &report[self.layout.data..],
        })
    }
}

/// One page write of an upload.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageWrite<'a> {
    pub opcode: Opcode,
    pub address: Address,
    /// Image bytes of this page; may be short or empty, the rest is sent erased.
    pub data: &'a [u8],
}

/// Splits an application image into the page writes uploading it.
///
/// Every page below the updater is written, so the last one always carries the shadow
/// slots. The first write also erases the application.
pub struct WriteSequence<'a> {
    image: &'a [u8],
    geometry: Geometry,
    next: Address,
}

impl<'a> WriteSequence<'a> {
    pub fn new(image: &'a [u8], geometry: Geometry) -> Result<Self, Error> {
        if image.len() > geometry.loader_start as usize {
            return Err(Error::SelfOverwrite);
        }
        Ok(Self {
            image,
            geometry,
            next: 0,
        })
    }
}

impl<'a> Iterator for WriteSequence<'a> {
    type Item = PageWrite<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.geometry.loader_start {
            return None;
        }
        let address = self.next;
        self.next += Address::from(self.geometry.page_size);

        let start = (address as usize).min(self.image.len());
        let end = (self.next as usize).min(self.image.len());
        let opcode = if address == 0 {
            Opcode::ERASE | Opcode::WRITE
        } else {
            Opcode::WRITE
        };
        Some(PageWrite {
            opcode,
            address,
            data: &self.image[start..end],
        })
    }
}

/// Lay out the application image that replaces the updater with `updater` at `destination`.
///
/// `image` receives the reloader program from address 0, its descriptor at the layout's
/// info address and the staged updater one page later. Everything else is left erased.
/// Pass at most the application region as `image`. Returns the number of bytes used.
pub fn build_reload_image(
    layout: &ReloaderLayout,
    reloader: &[u8],
    updater: &[u8],
    destination: Address,
    image: &mut [u8],
) -> Result<usize, Error> {
    let info = layout.info_address as usize;
    let staged = layout.staged_start() as usize;
    let size = layout
        .flash_size
        .checked_sub(destination)
        .ok_or(Error::OutOfBounds)? as usize;
    let end = staged + size;

    if reloader.len() > info || updater.len() > size || end > image.len() {
        return Err(Error::OutOfBounds);
    }

    image[..end].fill(0xff);
    image[..reloader.len()].copy_from_slice(reloader);
    image[staged..staged + updater.len()].copy_from_slice(updater);

    let descriptor = Descriptor {
        destination,
        checksum: CRC16.checksum(&image[staged..end]),
    };
    image[info..info + Descriptor::LEN].copy_from_slice(&descriptor.to_bytes());
    Ok(end)
}
