//! Installation of a validated staged image as a resumable sequence of steps.

use crate::{
    Address,
    reloader::{Descriptor, ReloaderLayout},
};

/// Step number of an installation that has to be or has been executed.
///
/// What operation this step entails can be extracted from the strategy.
/// Every step can be interrupted at any time; running all steps again from the start
/// must always be valid.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Step(pub u16);

/// Single page operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Operation {
    /// Erase the page starting at this address.
    Erase(Address),
    /// Erase `to` and copy the page at `from` into it, leaving `from` intact.
    Copy { from: Address, to: Address },
}

/// An installation strategy.
pub trait Strategy {
    /// The step which denotes that installation has completed and the image can be entered.
    ///
    /// Planning this step or any later one yields nothing.
    fn last_step(&self) -> Step;

    /// Plan the operations to be executed for a given step.
    fn plan(&self, step: Step) -> impl Iterator<Item = Operation>;
}

/// Erases the vector table, which commits to the update.
const POINT_OF_NO_RETURN: Step = Step(0);
/// Erases the page below the destination, holding the new updater's shadow slots.
const CLEAR_SHADOW: Step = Step(1);
const FIRST_COPY: u16 = 2;

/// Copy of the staged image over the resident updater, one page per step.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Install {
    layout: ReloaderLayout,
    destination: Address,
    resume: bool,
}

impl Install {
    pub(crate) fn new(layout: ReloaderLayout, descriptor: Descriptor, resume: bool) -> Self {
        Self {
            layout,
            destination: descriptor.destination,
            resume,
        }
    }

    pub const fn destination(&self) -> Address {
        self.destination
    }

    /// Whether the point of no return was passed by an earlier attempt.
    pub const fn resuming(&self) -> bool {
        self.resume
    }

    /// Steps still to execute, in order.
    pub fn steps(&self) -> impl Iterator<Item = Step> + use<> {
        let first = if self.resume {
            CLEAR_SHADOW
        } else {
            POINT_OF_NO_RETURN
        };
        (first.0..self.last_step().0).map(Step)
    }

    fn page_count(&self) -> u16 {
        let page = Address::from(self.layout.page_size);
        ((self.layout.flash_size - self.destination) / page) as u16
    }
}

impl Strategy for Install {
    fn last_step(&self) -> Step {
        Step(FIRST_COPY + self.page_count())
    }

    fn plan(&self, step: Step) -> impl Iterator<Item = Operation> {
        let page = Address::from(self.layout.page_size);
        let operation = match step {
            POINT_OF_NO_RETURN if !self.resume => Some(Operation::Erase(0)),
            CLEAR_SHADOW => Some(Operation::Erase(self.destination - page)),
            Step(n) if n >= FIRST_COPY && step < self.last_step() => {
                let offset = Address::from(n - FIRST_COPY) * page;
                Some(Operation::Copy {
                    from: self.layout.staged_start() + offset,
                    to: self.destination + offset,
                })
            }
            _ => None,
        };
        operation.into_iter()
    }
}
