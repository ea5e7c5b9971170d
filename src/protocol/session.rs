//! Assembly of one command report out of transport chunks.

use crate::{flash::MAX_PAGE_SIZE, log, protocol::Command};

/// Room for the largest page plus any header layout.
pub const MAX_REPORT_LEN: usize = MAX_PAGE_SIZE + 8;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    Idle,
    /// Collecting chunks of a report sent by the host.
    Accumulating,
    /// A validated command waits for its countdown to expire.
    Dispatched { countdown: u8 },
    /// The countdown expired and the command is being executed.
    Executing,
}

/// State of the transaction in flight, owned by the dispatch loop.
///
/// Lives for exactly one transaction: it returns to [`State::Idle`] once the command was
/// executed or rejected.
pub struct Session {
    report: [u8; MAX_REPORT_LEN],
    len: usize,
    received: usize,
    state: State,
    pending: Option<Command>,
}

impl Session {
    pub const fn new() -> Self {
        Self {
            report: [0; MAX_REPORT_LEN],
            len: 0,
            received: 0,
            state: State::Idle,
            pending: None,
        }
    }

    pub const fn state(&self) -> State {
        self.state
    }

    /// Whether a command was accepted and has not finished executing.
    pub const fn is_busy(&self) -> bool {
        matches!(self.state, State::Dispatched { .. } | State::Executing)
    }

    /// Open a transaction expecting a report of `len` bytes.
    ///
    /// Returns `false` without touching anything while a command is pending.
    pub fn begin(&mut self, len: usize) -> bool {
        if self.is_busy() {
            return false;
        }
        self.len = len.min(MAX_REPORT_LEN);
        self.received = 0;
        self.state = State::Accumulating;
        true
    }

    /// Append a chunk, truncated to the room left in the report.
    ///
    /// Returns whether the report is now complete, or `None` if no transaction is open.
    pub fn append(&mut self, chunk: &[u8]) -> Option<bool> {
        if self.state != State::Accumulating {
            return None;
        }
        let take = chunk.len().min(self.len - self.received);
        self.report[self.received..self.received + take].copy_from_slice(&chunk[..take]);
        self.received += take;
        Some(self.received == self.len)
    }

    /// The report as received so far.
    pub fn report(&self) -> &[u8] {
        &self.report[..self.received]
    }

    /// Report buffer for building a reply of `len` bytes.
    pub fn reply_buffer(&mut self, len: usize) -> &mut [u8] {
        &mut self.report[..len.min(MAX_REPORT_LEN)]
    }

    /// Reply built with [`Session::reply_buffer`].
    pub fn reply(&self, len: usize) -> &[u8] {
        &self.report[..len.min(MAX_REPORT_LEN)]
    }

    /// Hand a validated command to the dispatcher, to run after `countdown` loop iterations.
    pub fn dispatch(&mut self, command: Command, countdown: u8) {
        log::debug!("dispatching {:?} in {} polls", command, countdown);
        self.pending = Some(command);
        self.state = State::Dispatched {
            countdown: countdown.max(1),
        };
    }

    /// Drop the report without executing anything.
    pub fn reject(&mut self) {
        self.report.fill(0);
        self.received = 0;
        self.pending = None;
        self.state = State::Idle;
    }

    /// Close a transaction that needs no deferred execution.
    pub fn close(&mut self) {
        self.state = State::Idle;
    }

    /// Advance the countdown; yields the command once it expires.
    pub fn tick(&mut self) -> Option<Command> {
        let State::Dispatched { countdown } = self.state else {
            return None;
        };
        if countdown > 1 {
            self.state = State::Dispatched {
                countdown: countdown - 1,
            };
            return None;
        }
        self.state = State::Executing;
        self.pending
    }

    /// The executed command is done; accept new transactions.
    pub fn finish(&mut self) {
        self.pending = None;
        self.state = State::Idle;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Opcode;

    const COMMAND: Command = Command {
        opcode: Opcode::WRITE,
        address: None,
    };

    #[test]
    fn chunks_are_truncated_to_the_report() {
        let mut session = Session::new();
        assert!(session.begin(10));

        assert_eq!(session.append(&[1; 8]), Some(false));
        assert_eq!(session.append(&[2; 8]), Some(true));
        assert_eq!(session.report(), &[1, 1, 1, 1, 1, 1, 1, 1, 2, 2]);
    }

    #[test]
    fn chunk_without_transaction() {
        let mut session = Session::new();
        assert_eq!(session.append(&[0; 8]), None);
    }

    #[test]
    fn busy_while_pending() {
        let mut session = Session::new();
        assert!(session.begin(4));
        session.append(&[0; 4]);
        session.dispatch(COMMAND, 3);

        assert!(!session.begin(4));
        assert_eq!(session.append(&[0; 4]), None);

        assert_eq!(session.tick(), None);
        assert_eq!(session.tick(), None);
        assert_eq!(session.tick(), Some(COMMAND));
        assert_eq!(session.state(), State::Executing);
        assert!(!session.begin(4));

        session.finish();
        assert!(session.begin(4));
    }

    #[test]
    fn countdown_fires_once() {
        let mut session = Session::new();
        session.begin(1);
        session.append(&[0]);
        session.dispatch(COMMAND, 2);

        let fired = (0..10).filter_map(|_| session.tick()).count();
        assert_eq!(fired, 1);
    }

    #[test]
    fn reject_clears_payload() {
        let mut session = Session::new();
        session.begin(4);
        session.append(&[9; 4]);
        session.reject();

        assert_eq!(session.state(), State::Idle);
        assert!(session.report().is_empty());
        assert!(session.reply_buffer(4).iter().all(|&b| b == 0));
    }
}
