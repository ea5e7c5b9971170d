use std::{cell::Cell, collections::BTreeMap, rc::Rc, vec, vec::Vec};

use embedded_storage::{ReadStorage, Storage};

use crate::{
    Address,
    board::Board,
    flash::{Flash, Geometry},
    suspend::Interrupts,
};

/// 1 KiB memory with 64-byte pages and the updater in the top two pages.
pub const SMALL: Geometry = Geometry {
    page_size: 64,
    flash_size: 1024,
    loader_start: 896,
};

#[derive(Debug)]
pub struct WearTracker(BTreeMap<Address, usize>);

impl WearTracker {
    pub const fn new() -> Self {
        WearTracker(BTreeMap::new())
    }

    pub fn increase(&mut self, page: Address) {
        *self.0.entry(page).or_insert(0) += 1;
    }

    pub fn get(&self, page: Address) -> usize {
        self.0.get(&page).copied().unwrap_or(0)
    }

    /// Check wear on all pages within `range` for worst wear.
    pub fn check_range(&self, range: core::ops::Range<Address>, wear_level: usize) -> bool {
        self.0
            .iter()
            .filter(|(page, _)| range.contains(*page))
            .all(|(_, v)| *v <= wear_level)
    }
}

/// Program memory with a volatile page buffer and NOR-like commits.
///
/// A power budget simulates losing power: once spent, every further erase, fill or
/// commit is silently lost, until [`MockFlash::power_cycle`].
pub struct MockFlash {
    pub memory: Vec<u8>,
    buffer: Vec<Option<u16>>,
    page_size: u16,
    pub wear: WearTracker,
    budget: Option<usize>,
    /// Interrupt line to check mutations against.
    interrupts: Option<Rc<Cell<bool>>>,
    pub unguarded_mutations: usize,
}

impl MockFlash {
    pub fn new(flash_size: u32, page_size: u16) -> Self {
        Self {
            memory: vec![0xff; flash_size as usize],
            buffer: vec![None; usize::from(page_size) / 2],
            page_size,
            wear: WearTracker::new(),
            budget: None,
            interrupts: None,
            unguarded_mutations: 0,
        }
    }

    pub fn bytes(&self, addr: Address, len: usize) -> &[u8] {
        &self.memory[addr as usize..addr as usize + len]
    }

    /// Place raw content, as a programmer would before the device ever ran.
    pub fn load(&mut self, addr: Address, data: &[u8]) {
        self.memory[addr as usize..addr as usize + data.len()].copy_from_slice(data);
    }

    /// Let only `operations` more erase, fill or commit operations reach the memory.
    pub fn set_power_budget(&mut self, operations: usize) {
        self.budget = Some(operations);
    }

    /// Power comes back: the page buffer is gone, memory persists.
    pub fn power_cycle(&mut self) {
        self.buffer.fill(None);
        self.budget = None;
    }

    /// Count mutations made while `line` reports interrupts enabled.
    pub fn watch_interrupts(&mut self, line: Rc<Cell<bool>>) {
        self.interrupts = Some(line);
    }

    fn spend(&mut self) -> bool {
        if let Some(line) = &self.interrupts {
            if line.get() {
                self.unguarded_mutations += 1;
            }
        }
        match &mut self.budget {
            Some(0) => false,
            Some(left) => {
                *left -= 1;
                true
            }
            None => true,
        }
    }
}

impl Flash for MockFlash {
    fn read(&self, addr: Address, buf: &mut [u8]) {
        buf.copy_from_slice(self.bytes(addr, buf.len()));
    }

    fn erase_page(&mut self, page: Address) {
        if !self.spend() {
            return;
        }
        let start = page as usize;
        self.memory[start..start + usize::from(self.page_size)].fill(0xff);
        self.wear.increase(page);
    }

    fn fill_word(&mut self, addr: Address, word: u16) {
        if !self.spend() {
            return;
        }
        let index = (addr % u32::from(self.page_size)) as usize / 2;
        self.buffer[index] = Some(word);
    }

    fn write_page(&mut self, page: Address) {
        if !self.spend() {
            return;
        }
        for (i, word) in self.buffer.iter_mut().enumerate() {
            if let Some(word) = word.take() {
                let at = page as usize + 2 * i;
                let [lo, hi] = word.to_le_bytes();
                self.memory[at] &= lo;
                self.memory[at + 1] &= hi;
            }
        }
    }

    fn clear_buffer(&mut self) {
        self.buffer.fill(None);
    }
}

/// Board with observable pins and interrupt state.
pub struct MockBoard {
    interrupts: Rc<Cell<bool>>,
    pub suspensions: usize,
    pub entry_signal: bool,
    pub marker: bool,
    pub indicator: bool,
    pub indications: usize,
    pub failures: Vec<u8>,
    pub torn_down: bool,
}

impl MockBoard {
    pub fn new() -> Self {
        Self {
            interrupts: Rc::new(Cell::new(true)),
            suspensions: 0,
            entry_signal: false,
            marker: false,
            indicator: false,
            indications: 0,
            failures: Vec::new(),
            torn_down: false,
        }
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts.get()
    }

    pub fn interrupt_line(&self) -> Rc<Cell<bool>> {
        self.interrupts.clone()
    }
}

impl Interrupts for MockBoard {
    fn suspend(&mut self) {
        self.interrupts.set(false);
        self.suspensions += 1;
    }

    fn resume(&mut self) {
        self.interrupts.set(true);
    }
}

impl Board for MockBoard {
    fn entry_signal(&mut self) -> bool {
        self.entry_signal
    }

    fn reentry_marker(&mut self) -> bool {
        self.marker
    }

    fn set_reentry_marker(&mut self, set: bool) {
        self.marker = set;
    }

    fn indicate(&mut self, on: bool) {
        if on {
            self.indications += 1;
        }
        self.indicator = on;
    }

    fn report_failure(&mut self, code: u8) {
        self.failures.push(code);
    }

    fn teardown(&mut self) {
        self.torn_down = true;
    }
}

/// Byte-wise persistent store.
pub struct MockStore {
    pub data: Vec<u8>,
    pub writes: usize,
    pub broken: bool,
}

impl MockStore {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0x42; size],
            writes: 0,
            broken: false,
        }
    }
}

impl ReadStorage for MockStore {
    type Error = ();

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        bytes.copy_from_slice(&self.data[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Storage for MockStore {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if self.broken {
            return Err(());
        }
        let start = offset as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.writes += 1;
        Ok(())
    }
}

/// Delay that returns immediately.
pub struct NoDelay;

impl embedded_hal::delay::DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}
