use crate::{EntryPoint, boot::Boot, suspend::Interrupts};

/// Cortex-M core: global interrupt masking and a plain branch to a code address.
///
/// Entry points are the targets the vector jumps lead to, never a vector table, so no
/// stack pointer is loaded on the way.
pub struct CortexM;

impl CortexM {
    /// Branch target for `entry`, with the Thumb state bit set.
    pub const fn thumb(entry: EntryPoint) -> usize {
        entry.addr() as usize | 1
    }
}

impl Boot for CortexM {
    unsafe fn boot(entry: EntryPoint) -> ! {
        cortex_m::interrupt::disable();
        let target = Self::thumb(entry);
        let jump = unsafe { core::mem::transmute::<usize, extern "C" fn() -> !>(target) };
        jump()
    }
}

impl Interrupts for CortexM {
    fn suspend(&mut self) {
        cortex_m::interrupt::disable();
    }

    fn resume(&mut self) {
        // Only ever pairs with a preceding `suspend`.
        unsafe { cortex_m::interrupt::enable() }
    }
}
