//! Vector table interception.
//!
//! Every vector holds a single relative jump word. The updater keeps the hardware vectors
//! pointing at its own vector table (the trampoline), and parks the application's
//! original words in two shadow slots right below its reserved region.

use crate::{Address, flash::Geometry};

const RJMP_OPCODE: u16 = 0xc000;
const RJMP_MASK: u16 = 0xf000;
const RJMP_OFFSET: u16 = 0x0fff;
/// Words a relative jump can span, forwards and backwards together.
const RJMP_SPAN: u32 = 0x1000;

/// Relative jump instruction: `0xC000 | k`, landing on word `at / 2 + 1 + k`.
///
/// The 12-bit offset is signed and the target wraps around the end of program memory.
pub struct Rjmp;

impl Rjmp {
    /// Absolute byte target of the jump word `word` placed at `at`, if it is a relative jump.
    pub fn decode(word: u16, at: Address, flash_size: u32) -> Option<Address> {
        if !Self::is_jump(word) {
            return None;
        }
        // Sign-extend the 12-bit offset.
        let k = (((word & RJMP_OFFSET) << 4) as i16 >> 4) as i64;
        let words = i64::from(flash_size / 2);
        let target = (i64::from(at / 2) + 1 + k).rem_euclid(words);
        Some((target * 2) as Address)
    }

    /// Jump word placed at `at` that lands on `target`, if within reach.
    pub fn encode(at: Address, target: Address, flash_size: u32) -> Option<u16> {
        let words = i64::from(flash_size / 2);
        let delta = i64::from(target / 2) - i64::from(at / 2) - 1;
        [delta, delta - words, delta + words]
            .into_iter()
            .find(|k| (-2048..=2047).contains(k))
            .map(|k| RJMP_OPCODE | (k as u16 & RJMP_OFFSET))
    }

    pub const fn is_jump(word: u16) -> bool {
        word & RJMP_MASK == RJMP_OPCODE
    }

    /// Whether every word of a memory of `flash_size` bytes is reachable from every other,
    /// with offsets wrapping exactly at the end of memory.
    pub const fn wraps(flash_size: u32) -> bool {
        let words = flash_size / 2;
        words.is_power_of_two() && words <= RJMP_SPAN
    }
}

/// Where an intercepted vector lives and where the application's copy of it is parked.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Vector {
    /// Offset read by the hardware.
    pub hardware: Address,
    /// Shadow slot holding the application's jump.
    pub shadow: Address,
    /// Entry of the updater's own handler for this vector.
    pub trampoline: Address,
}

/// The two intercepted vectors.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VectorTable {
    pub reset: Vector,
    pub secondary: Vector,
    flash_size: u32,
}

impl VectorTable {
    pub const fn new(geometry: &Geometry, secondary_vector: Address) -> Self {
        Self {
            reset: Vector {
                hardware: 0,
                shadow: geometry.loader_start - 4,
                trampoline: geometry.loader_start,
            },
            secondary: Vector {
                hardware: secondary_vector,
                shadow: geometry.loader_start - 2,
                trampoline: geometry.loader_start + secondary_vector,
            },
            flash_size: geometry.flash_size,
        }
    }

    pub fn vectors(&self) -> [Vector; 2] {
        [self.reset, self.secondary]
    }

    /// Jump word the hardware vector must hold while the updater is resident.
    pub fn trampoline_jump(&self, vector: &Vector) -> Option<u16> {
        Rjmp::encode(vector.hardware, vector.trampoline, self.flash_size)
    }

    /// Word parked in the shadow slot of `vector` for the application's `original`.
    ///
    /// A relative jump is shifted so it reaches the same target from the slot; on memories
    /// that [`Rjmp::wraps`] this is exact. Anything else is parked unchanged.
    pub fn relocate(&self, vector: &Vector, original: u16) -> u16 {
        if Rjmp::is_jump(original) {
            RJMP_OPCODE | (original.wrapping_add(self.shift(vector)) & RJMP_OFFSET)
        } else {
            original
        }
    }

    /// The application's original word, given what [`Self::relocate`] parked.
    pub fn restore(&self, vector: &Vector, parked: u16) -> u16 {
        if Rjmp::is_jump(parked) {
            RJMP_OPCODE | (parked.wrapping_sub(self.shift(vector)) & RJMP_OFFSET)
        } else {
            parked
        }
    }

    /// Offset change, in words, of a jump moved from the hardware vector to its slot.
    fn shift(&self, vector: &Vector) -> u16 {
        ((vector.hardware / 2).wrapping_sub(vector.shadow / 2) & u32::from(RJMP_OFFSET)) as u16
    }

    /// Where the jump parked in the shadow slot of `vector` lands.
    pub fn forward(&self, vector: &Vector, shadow_word: u16) -> Option<Address> {
        Rjmp::decode(shadow_word, vector.shadow, self.flash_size)
    }

    pub const fn flash_size(&self) -> u32 {
        self.flash_size
    }
}
