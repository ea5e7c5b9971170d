//! Self-programming firmware updater for small microcontrollers.
//!
//! The updater lives at the top of program memory, receives page-sized command reports
//! from a host and writes the application below itself while intercepting the hardware
//! vector table, so that every reset passes through the updater first.
//! The [`reloader`] replaces the updater itself from a staged image.
#![no_std]

pub mod board;
pub mod boot;
pub mod checksum;
pub mod config;
pub mod engine;
pub mod flash;
pub mod host;
pub mod protocol;
pub mod reloader;
pub mod suspend;
pub mod updater;
pub mod vectors;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod mock;

pub use boot::Boot;
pub use config::Config;
pub use engine::Engine;
pub use flash::{Flash, Geometry, PageAddress};
pub use reloader::Reloader;
pub use suspend::{Interrupts, Suspended};
pub use board::Board;
pub use updater::Updater;

/// Byte address in program memory.
pub type Address = u32;

#[cfg(feature = "defmt")]
pub(crate) use defmt as log;

#[cfg(all(feature = "log", not(feature = "defmt")))]
pub(crate) use ::log;

#[cfg(not(any(feature = "log", feature = "defmt")))]
pub(crate) mod log {
    // Named apart from the built-in `warn` attribute, which a same-named macro clashes with.
    macro_rules! log_info {
        ( $( $x:expr ),* $(,)? ) => {{ $( let _ = &$x; )* }};
    }
    pub(crate) use log_info as info;
    macro_rules! log_debug {
        ( $( $x:expr ),* $(,)? ) => {{ $( let _ = &$x; )* }};
    }
    pub(crate) use log_debug as debug;
    macro_rules! log_warn {
        ( $( $x:expr ),* $(,)? ) => {{ $( let _ = &$x; )* }};
    }
    pub(crate) use log_warn as warn;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Checksum or complement byte did not match the received report.
    IntegrityMismatch,
    /// Address lies beyond program memory.
    OutOfBounds,
    /// Address is not aligned to a page.
    Misaligned,
    /// A new transaction started while a command is still pending.
    Busy,
    /// Write would touch the updater's own reserved region.
    SelfOverwrite,
    /// Opcode unknown or disabled in the configuration.
    Unsupported,
    /// Configuration or memory layout the updater cannot operate with.
    InvalidConfig,
    /// The persistent data store reported a failure.
    Storage,
}

/// Program memory location control is handed to.
///
/// The core only ever computes this; the jump itself happens in [`boot::Boot`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EntryPoint(pub Address);

impl EntryPoint {
    pub const fn addr(self) -> Address {
        self.0
    }
}
