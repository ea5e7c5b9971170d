//! Scoped suspension of asynchronous event servicing.

/// Global interrupt control of the device.
pub trait Interrupts {
    /// Stop servicing asynchronous events.
    fn suspend(&mut self);

    /// Resume servicing asynchronous events.
    fn resume(&mut self);
}

/// Keeps asynchronous servicing suspended for as long as it lives.
///
/// Servicing resumes when the guard is dropped, on every exit path.
/// Hold one for at most a single page's erase, fill and commit sequence.
pub struct Suspended<'a, I: Interrupts + ?Sized> {
    interrupts: &'a mut I,
}

impl<'a, I: Interrupts + ?Sized> Suspended<'a, I> {
    pub fn new(interrupts: &'a mut I) -> Self {
        interrupts.suspend();
        Self { interrupts }
    }
}

impl<I: Interrupts + ?Sized> Drop for Suspended<'_, I> {
    fn drop(&mut self) {
        self.interrupts.resume();
    }
}
