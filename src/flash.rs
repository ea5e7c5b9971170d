//! Program memory: hardware primitives and page-checked addressing.

use crate::{Address, Error};

/// Self-programming primitives of the program memory controller.
///
/// Writing is a three-step affair: a page is erased, words are filled into a volatile
/// page buffer, and the buffer is committed to one page. Committing can only clear bits,
/// so a page must be erased before it is committed with new content.
/// None of these operations report failure; they are considered to always complete.
pub trait Flash {
    /// Read bytes starting at `addr`.
    fn read(&self, addr: Address, buf: &mut [u8]);

    /// Read one little-endian word.
    fn read_word(&self, addr: Address) -> u16 {
        let mut word = [0u8; 2];
        self.read(addr, &mut word);
        u16::from_le_bytes(word)
    }

    /// Erase the page starting at `page`, setting all its bits.
    fn erase_page(&mut self, page: Address);

    /// Stage a word into the page buffer for the next commit.
    fn fill_word(&mut self, addr: Address, word: u16);

    /// Commit the page buffer to the page starting at `page`, emptying the buffer.
    fn write_page(&mut self, page: Address);

    /// Drop everything staged in the page buffer.
    fn clear_buffer(&mut self);
}

/// Size of program memory and where the updater resides.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Geometry {
    /// Erase and write granularity, in bytes.
    pub page_size: u16,
    pub flash_size: u32,
    /// First byte of the updater's reserved region; nothing at or beyond it is ever written.
    pub loader_start: Address,
}

/// Largest page the protocol buffers can hold.
pub const MAX_PAGE_SIZE: usize = 256;

/// Value of an erased (unprogrammed) word.
pub const ERASED_WORD: u16 = 0xffff;

impl Geometry {
    pub fn validate(&self) -> Result<(), Error> {
        let page = u32::from(self.page_size);
        if !self.page_size.is_power_of_two()
            || usize::from(self.page_size) > MAX_PAGE_SIZE
            || page < 4
        {
            return Err(Error::InvalidConfig);
        }
        if self.flash_size % page != 0 || self.loader_start % page != 0 {
            return Err(Error::InvalidConfig);
        }
        // The shadow slots occupy the last page before the updater.
        if self.loader_start < 2 * page || self.loader_start >= self.flash_size {
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }

    /// Check that `addr` starts a page the updater is allowed to write.
    pub fn page(&self, addr: Address) -> Result<PageAddress, Error> {
        if addr % u32::from(self.page_size) != 0 {
            Err(Error::Misaligned)
        } else if addr >= self.flash_size {
            Err(Error::OutOfBounds)
        } else if addr >= self.loader_start {
            Err(Error::SelfOverwrite)
        } else {
            Ok(PageAddress(addr))
        }
    }

    /// Writable application pages, highest first.
    pub fn application_pages(&self) -> impl Iterator<Item = PageAddress> {
        let page = u32::from(self.page_size);
        (0..self.loader_start / page).rev().map(move |i| PageAddress(i * page))
    }

    pub const fn first_page(&self) -> PageAddress {
        PageAddress(0)
    }

    pub const fn flash_words(&self) -> u32 {
        self.flash_size / 2
    }
}

/// Page-aligned address below the updater's reserved region.
///
/// Only obtainable through [`Geometry::page`], so holding one proves the bounds check.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PageAddress(Address);

impl PageAddress {
    pub const fn addr(self) -> Address {
        self.0
    }

    /// Word addresses covered by this page, ascending.
    pub fn words(self, page_size: u16) -> impl Iterator<Item = Address> {
        (self.0..self.0 + u32::from(page_size)).step_by(2)
    }

    pub const fn contains(self, addr: Address, page_size: u16) -> bool {
        addr >= self.0 && addr < self.0 + page_size as u32
    }
}
