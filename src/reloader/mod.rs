//! Replacement of the resident updater itself.
//!
//! The reloader is uploaded like any application. Its image carries a [`Descriptor`] and the
//! new updater, staged one page after it. At boot everything is checked without writing a
//! single byte; only then is the first page erased. From that point there is no way back:
//! every following boot finds the vector table erased and resumes copying the staged image
//! over the old updater, until the new one is entered.

mod install;

pub use install::{Install, Operation, Step, Strategy};

use crate::{
    Address, EntryPoint, Error,
    board::Board,
    checksum::CRC16,
    flash::{ERASED_WORD, Flash, MAX_PAGE_SIZE},
    log,
    suspend::Suspended,
    vectors::Rjmp,
};

/// Where the reloader finds its descriptor, on a device of the given size.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReloaderLayout {
    pub page_size: u16,
    pub flash_size: u32,
    /// Page right after the reloader program, holding the descriptor.
    pub info_address: Address,
}

impl ReloaderLayout {
    pub fn validate(&self) -> Result<(), Error> {
        let page = Address::from(self.page_size);
        if !self.page_size.is_power_of_two()
            || usize::from(self.page_size) > MAX_PAGE_SIZE
            || page < 4
            || self.flash_size % page != 0
        {
            return Err(Error::InvalidConfig);
        }
        // The first page is erased while the descriptor must survive.
        if self.info_address % page != 0
            || self.info_address < page
            || self.staged_start() >= self.flash_size
        {
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }

    /// First byte of the staged updater image.
    pub const fn staged_start(&self) -> Address {
        self.info_address + self.page_size as Address
    }
}

/// Fixed record in front of the staged image.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Descriptor {
    /// Where the new updater goes; it extends to the end of program memory.
    pub destination: Address,
    /// CRC-16 over the staged image.
    pub checksum: u16,
}

impl Descriptor {
    pub const LEN: usize = 4;

    pub fn from_bytes(raw: [u8; Self::LEN]) -> Self {
        Self {
            destination: Address::from(u16::from_le_bytes([raw[0], raw[1]])),
            checksum: u16::from_le_bytes([raw[2], raw[3]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let [d0, d1] = (self.destination as u16).to_le_bytes();
        let [c0, c1] = self.checksum.to_le_bytes();
        [d0, d1, c0, c1]
    }
}

/// Reason a staged image was refused. The value is the code shown on the status indicator.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Rejection {
    /// Destination lies beyond program memory.
    OutOfBounds = 0x01,
    /// Destination does not start a page.
    Misaligned = 0x05,
    /// Staged image plus one page of margin reaches into the destination.
    TooLarge = 0x07,
    /// CRC-16 over the staged image differs from the descriptor.
    Checksum = 0x21,
    /// First staged word does not jump into the new image.
    Entry = 0x30,
}

impl Rejection {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Where execution continues after the reloader ran.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// The new updater is in place.
    Installed { entry: EntryPoint },
    /// Nothing was written; the resident updater takes over through the reset vector.
    Rejected {
        rejection: Rejection,
        entry: EntryPoint,
    },
}

impl Outcome {
    pub const fn entry(&self) -> EntryPoint {
        match self {
            Outcome::Installed { entry } | Outcome::Rejected { entry, .. } => *entry,
        }
    }
}

pub struct Reloader<F: Flash> {
    flash: F,
    layout: ReloaderLayout,
}

impl<F: Flash> Reloader<F> {
    pub fn new(flash: F, layout: ReloaderLayout) -> Result<Self, Error> {
        layout.validate()?;
        Ok(Self { flash, layout })
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn release(self) -> F {
        self.flash
    }

    pub fn descriptor(&self) -> Descriptor {
        let mut raw = [0u8; Descriptor::LEN];
        self.flash.read(self.layout.info_address, &mut raw);
        Descriptor::from_bytes(raw)
    }

    /// Whether an earlier attempt already passed the point of no return.
    pub fn resuming(&self) -> bool {
        self.flash.read_word(0) == ERASED_WORD
    }

    /// Check the staged image without writing anything.
    ///
    /// When resuming, the checksum and entry checks are skipped: the copy that was
    /// interrupted may already have overwritten whatever they depended on.
    pub fn validate(&self) -> Result<Install, Rejection> {
        let descriptor = self.descriptor();
        let page = Address::from(self.layout.page_size);
        let destination = descriptor.destination;

        if destination >= self.layout.flash_size {
            return Err(Rejection::OutOfBounds);
        }
        if destination % page != 0 {
            return Err(Rejection::Misaligned);
        }
        let size = self.layout.flash_size - destination;
        if self.layout.staged_start() + size + page > destination {
            return Err(Rejection::TooLarge);
        }

        let resume = self.resuming();
        if !resume {
            if self.checksum(size) != descriptor.checksum {
                return Err(Rejection::Checksum);
            }
            let first = self.flash.read_word(self.layout.staged_start());
            match Rjmp::decode(first, destination, self.layout.flash_size) {
                Some(target) if target >= destination => {}
                _ => return Err(Rejection::Entry),
            }
        }
        Ok(Install::new(self.layout, descriptor, resume))
    }

    /// Validate and install the staged image.
    ///
    /// On rejection the failure code is reported and the re-entry marker set, so that the
    /// resident updater stays in update mode once it gets control.
    pub fn run<B: Board>(&mut self, board: &mut B) -> Outcome {
        let install = match self.validate() {
            Ok(install) => install,
            Err(rejection) => {
                log::warn!("staged updater rejected: {:?}", rejection);
                board.report_failure(rejection.code());
                board.set_reentry_marker(true);
                return Outcome::Rejected {
                    rejection,
                    entry: EntryPoint(0),
                };
            }
        };

        if install.resuming() {
            log::info!("resuming interrupted updater installation");
        }
        for step in install.steps() {
            log::debug!("installation step {}", step.0);
            let _guard = Suspended::new(&mut *board);
            for operation in install.plan(step) {
                self.perform(operation);
            }
        }

        let entry = EntryPoint(install.destination());
        log::info!("updater installed, entering {:?}", entry);
        Outcome::Installed { entry }
    }

    fn perform(&mut self, operation: Operation) {
        match operation {
            Operation::Erase(page) => self.flash.erase_page(page),
            Operation::Copy { from, to } => {
                self.flash.erase_page(to);
                for offset in (0..Address::from(self.layout.page_size)).step_by(2) {
                    let word = self.flash.read_word(from + offset);
                    self.flash.fill_word(to + offset, word);
                }
                self.flash.write_page(to);
            }
        }
    }

    fn checksum(&self, size: u32) -> u16 {
        let mut digest = CRC16.digest();
        let mut buf = [0u8; MAX_PAGE_SIZE];
        let chunk = usize::from(self.layout.page_size);

        let mut addr = self.layout.staged_start();
        let end = addr + size;
        while addr < end {
            let len = chunk.min((end - addr) as usize);
            self.flash.read(addr, &mut buf[..len]);
            digest.update(&buf[..len]);
            addr += len as Address;
        }
        digest.finalize()
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::{
        host::build_reload_image,
        mock::{MockBoard, MockFlash, SMALL},
    };

    const LAYOUT: ReloaderLayout = ReloaderLayout {
        page_size: 64,
        flash_size: 1024,
        info_address: 0x80,
    };
    const DESTINATION: Address = 896;
    /// Erase of the first page and the shadow page, then erase, fill and commit per page.
    const OPERATIONS: usize = 2 + 2 * (1 + 32 + 1);

    fn new_updater() -> Vec<u8> {
        let mut image: Vec<u8> = (0..128u32).map(|i| (i * 3 + 1) as u8).collect();
        let jump = Rjmp::encode(DESTINATION, DESTINATION + 0x10, LAYOUT.flash_size).unwrap();
        image[0..2].copy_from_slice(&jump.to_le_bytes());
        image
    }

    /// Device running the reloader as its application, below the old updater.
    fn staged() -> MockFlash {
        let mut flash = MockFlash::new(SMALL.flash_size, SMALL.page_size);
        let mut reloader = [0x0fu8; 0x40];
        let jump = Rjmp::encode(0, 0x20, LAYOUT.flash_size).unwrap();
        reloader[0..2].copy_from_slice(&jump.to_le_bytes());

        let mut image = [0u8; 896];
        let used = build_reload_image(&LAYOUT, &reloader, &new_updater(), DESTINATION, &mut image)
            .unwrap();
        flash.load(0, &image[..used]);
        flash.load(SMALL.loader_start - 64, &[0x33; 64]);
        flash.load(SMALL.loader_start, &[0x5a; 128]);
        flash
    }

    fn reloader(flash: MockFlash) -> Reloader<MockFlash> {
        Reloader::new(flash, LAYOUT).unwrap()
    }

    fn assert_installed(flash: &MockFlash) {
        assert_eq!(flash.bytes(DESTINATION, 128), new_updater().as_slice());
        assert!(flash.bytes(DESTINATION - 64, 64).iter().all(|&b| b == 0xff));
        assert!(flash.bytes(0, 64).iter().all(|&b| b == 0xff));
    }

    #[test]
    fn installs_staged_updater() {
        let mut board = MockBoard::new();
        let mut flash = staged();
        flash.watch_interrupts(board.interrupt_line());
        let mut reloader = reloader(flash);

        let outcome = reloader.run(&mut board);

        assert_eq!(
            outcome,
            Outcome::Installed {
                entry: EntryPoint(DESTINATION)
            }
        );
        assert_installed(reloader.flash());
        assert_eq!(reloader.flash().unguarded_mutations, 0);
        assert!(board.interrupts_enabled());
        assert_eq!(board.suspensions, 4);
        assert!(!board.marker);
        // The staging area is left for the new updater to erase.
        assert_eq!(reloader.flash().bytes(0xc0, 128), new_updater().as_slice());
    }

    #[test]
    fn corrupted_checksum_changes_nothing() {
        let mut flash = staged();
        flash.memory[0xc0 + 77] ^= 0x04;
        let before = flash.memory.clone();
        let mut board = MockBoard::new();
        let mut reloader = reloader(flash);

        let outcome = reloader.run(&mut board);

        assert_eq!(
            outcome,
            Outcome::Rejected {
                rejection: Rejection::Checksum,
                entry: EntryPoint(0)
            }
        );
        assert_eq!(reloader.flash().memory, before);
        assert_eq!(board.failures, [0x21]);
        assert!(board.marker);
        assert_eq!(board.suspensions, 0);
    }

    #[test]
    fn descriptor_checks_in_order() {
        let cases = [
            (1024, Rejection::OutOfBounds),
            (0x1000, Rejection::OutOfBounds),
            (900, Rejection::Misaligned),
            (320, Rejection::TooLarge),
            (768, Rejection::Checksum),
        ];
        for (destination, rejection) in cases {
            let mut flash = staged();
            let checksum = u16::from_le_bytes([flash.memory[0x82], flash.memory[0x83]]);
            flash.load(0x80, &Descriptor { destination, checksum }.to_bytes());
            let reloader = reloader(flash);

            assert_eq!(reloader.validate(), Err(rejection), "destination {destination:#x}");
        }
    }

    #[test]
    fn entry_must_jump_into_the_new_image() {
        let mut flash = staged();
        // Jump from the destination back into the application region.
        let jump = Rjmp::encode(DESTINATION, 0x100, LAYOUT.flash_size).unwrap();
        flash.load(0xc0, &jump.to_le_bytes());
        let mut raw = [0u8; 128];
        raw.copy_from_slice(flash.bytes(0xc0, 128));
        let checksum = CRC16.checksum(&raw);
        flash.load(0x82, &checksum.to_le_bytes());

        let mut board = MockBoard::new();
        let outcome = reloader(flash).run(&mut board);
        assert_eq!(outcome.entry(), EntryPoint(0));
        assert_eq!(board.failures, [0x30]);
    }

    #[test]
    fn resume_still_checks_geometry() {
        let mut flash = staged();
        flash.load(0, &[0xff; 64]);
        flash.load(0x80, &Descriptor { destination: 900, checksum: 0 }.to_bytes());

        assert_eq!(reloader(flash).validate(), Err(Rejection::Misaligned));
    }

    #[test]
    fn resume_skips_content_checks() {
        let mut flash = staged();
        // Power was lost right after the point of no return.
        flash.load(0, &[0xff; 64]);
        flash.load(0x82, &[0, 0]);

        let install = reloader(flash).validate().unwrap();
        assert!(install.resuming());
    }

    #[test]
    fn interrupted_installation_converges() {
        for cut in 0..=OPERATIONS {
            let mut flash = staged();
            flash.set_power_budget(cut);
            let mut board = MockBoard::new();
            let mut reloader = reloader(flash);
            reloader.run(&mut board);

            // Lose power at the same point of the resumed attempt, then once more let it run.
            let mut flash = reloader.release();
            flash.power_cycle();
            flash.set_power_budget(cut);
            let mut reloader = Reloader::new(flash, LAYOUT).unwrap();
            reloader.run(&mut board);

            let mut flash = reloader.release();
            flash.power_cycle();
            let mut reloader = Reloader::new(flash, LAYOUT).unwrap();
            let outcome = reloader.run(&mut board);

            assert_eq!(outcome.entry(), EntryPoint(DESTINATION), "cut after {cut}");
            assert_installed(reloader.flash());
            assert!(board.failures.is_empty(), "cut after {cut}");
        }
    }

    #[test]
    fn installation_wears_each_page_once() {
        let mut board = MockBoard::new();
        let mut reloader = reloader(staged());
        reloader.run(&mut board);

        let wear = &reloader.flash().wear;
        assert!(wear.check_range(0..1024, 1));
        assert_eq!(wear.get(0), 1);
        assert_eq!(wear.get(DESTINATION - 64), 1);
        assert_eq!(wear.get(DESTINATION), 1);
        assert_eq!(wear.get(0xc0), 0);
    }
}
