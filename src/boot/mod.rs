//! Transfer of control, the one thing the core never does itself.

#[cfg(feature = "cortex_m")]
pub mod cortex_m;

use crate::EntryPoint;

/// Jump mechanism of the target architecture.
pub trait Boot {
    /// Continue execution at `entry`, never to return.
    ///
    /// # Safety
    ///
    /// `entry` must hold valid code for the current core, and whatever the updater left
    /// behind (suspended interrupts, peripheral state) must be acceptable to it.
    unsafe fn boot(entry: EntryPoint) -> !;
}
