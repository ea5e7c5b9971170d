//! Page-granular programming with vector table interception.

use crate::{
    Address, EntryPoint,
    flash::{ERASED_WORD, Flash, Geometry, PageAddress},
    vectors::{Vector, VectorTable},
};

/// Programs application pages through the [`Flash`] primitives.
///
/// Writes aimed at the hardware vectors are redirected to the updater's trampoline;
/// the application's own words are latched and land in the shadow slots instead.
pub struct Engine<F: Flash> {
    flash: F,
    geometry: Geometry,
    vectors: VectorTable,
    /// Application words seen for the reset and secondary vector, in that order.
    latched: [Option<u16>; 2],
}

impl<F: Flash> Engine<F> {
    pub fn new(flash: F, geometry: Geometry, secondary_vector: Address) -> Self {
        Self {
            flash,
            geometry,
            vectors: VectorTable::new(&geometry, secondary_vector),
            latched: [None; 2],
        }
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn vectors(&self) -> &VectorTable {
        &self.vectors
    }

    pub fn release(self) -> F {
        self.flash
    }

    /// Erase a single page.
    pub fn erase_page(&mut self, page: PageAddress) {
        self.flash.erase_page(page.addr());
    }

    /// Stage one word for the next commit, intercepting vector writes.
    pub fn stage_word(&mut self, addr: Address, value: u16) {
        let [reset, secondary] = self.vectors.vectors();
        let word = if addr == reset.hardware {
            self.intercept(0, &reset, value)
        } else if addr == secondary.hardware {
            self.intercept(1, &secondary, value)
        } else if addr == reset.shadow {
            self.park(0, &reset)
        } else if addr == secondary.shadow {
            self.park(1, &secondary)
        } else {
            value
        };
        self.flash.fill_word(addr, word);
    }

    /// Commit everything staged to `page`.
    pub fn commit_page(&mut self, page: PageAddress) {
        self.flash.write_page(page.addr());
    }

    /// Erase, fill and commit one page from little-endian `data`.
    ///
    /// Bytes missing from `data` are programmed erased.
    pub fn program_page(&mut self, page: PageAddress, data: &[u8]) {
        self.erase_page(page);
        for (i, addr) in page.words(self.geometry.page_size).enumerate() {
            let lo = data.get(2 * i).copied().unwrap_or(0xff);
            let hi = data.get(2 * i + 1).copied().unwrap_or(0xff);
            self.stage_word(addr, u16::from_le_bytes([lo, hi]));
        }
        self.commit_page(page);
    }

    /// Program the first page blank, leaving only the jumps into the updater.
    pub fn initial_page(&mut self) {
        self.program_page(self.geometry.first_page(), &[]);
    }

    /// Throw away anything staged but not committed.
    pub fn discard(&mut self) {
        self.flash.clear_buffer();
    }

    /// Whether both hardware vectors lead into the updater.
    pub fn vectors_intact(&self) -> bool {
        self.vectors.vectors().iter().all(|vector| {
            self.vectors.trampoline_jump(vector) == Some(self.flash.read_word(vector.hardware))
        })
    }

    /// Whether an application parked its secondary vector, i.e. anything is installed.
    pub fn application_installed(&self) -> bool {
        self.flash.read_word(self.vectors.secondary.shadow) != ERASED_WORD
    }

    /// The word the application wrote to `vector`, recovered from its shadow slot.
    pub fn application_vector(&self, vector: &Vector) -> u16 {
        self.vectors.restore(vector, self.flash.read_word(vector.shadow))
    }

    /// Where the application's reset jump leads.
    ///
    /// Falls back to the shadow slot itself when it holds no relative jump; the slot then
    /// executes the application's instruction in place.
    pub fn application_entry(&self) -> EntryPoint {
        let reset = self.vectors.reset;
        let word = self.flash.read_word(reset.shadow);
        EntryPoint(self.vectors.forward(&reset, word).unwrap_or(reset.shadow))
    }

    fn intercept(&mut self, index: usize, vector: &Vector, value: u16) -> u16 {
        self.latched[index] = Some(value);
        // Geometries the trampoline cannot reach are refused by `Config::validate`.
        self.vectors.trampoline_jump(vector).unwrap_or(ERASED_WORD)
    }

    fn park(&self, index: usize, vector: &Vector) -> u16 {
        self.latched[index]
            .map(|original| self.vectors.relocate(vector, original))
            .unwrap_or(ERASED_WORD)
    }
}
