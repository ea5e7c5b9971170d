//! Hardware around program memory that both the updater and the reloader drive.

use crate::suspend::Interrupts;

/// Board glue around the updater and the reloader: pins, the re-entry marker and teardown.
pub trait Board: Interrupts {
    /// Whether the external entry signal is asserted.
    fn entry_signal(&mut self) -> bool {
        false
    }

    /// Marker an application sets before resetting to request update mode.
    ///
    /// While update mode runs the marker stays set; it also tells the interrupt
    /// trampoline to keep events inside the updater.
    fn reentry_marker(&mut self) -> bool;

    fn set_reentry_marker(&mut self, set: bool);

    /// Drive the status indicator.
    fn indicate(&mut self, _on: bool) {}

    /// Make a failure code visible, for example by blinking it.
    fn report_failure(&mut self, _code: u8) {}

    /// Restore whatever hardware state the updater changed.
    fn teardown(&mut self) {}
}
