//! Main dispatch loop of the resident updater.

use embedded_hal::delay::DelayNs;
use embedded_storage::{ReadStorage, Storage};

use crate::{
    Address, EntryPoint, Error,
    board::Board,
    boot::Boot,
    config::Config,
    engine::Engine,
    flash::{Flash, PageAddress},
    log,
    protocol::{
        ChunkStatus, Command, GET_REPORT, Opcode, SET_REPORT, Session, SetupRequest,
        SetupResponse,
    },
    suspend::{Interrupts, Suspended},
};

/// Callback surface the transport driver invokes.
pub trait Callbacks {
    fn on_setup(&mut self, request: &SetupRequest) -> Result<SetupResponse<'_>, Error>;

    fn on_chunk_write(&mut self, chunk: &[u8]) -> ChunkStatus;
}

/// Transport driver, polled once per loop iteration.
pub trait Transport {
    fn poll(&mut self, callbacks: &mut impl Callbacks);
}

/// Decision taken at cold boot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Start {
    /// Stay and service the host.
    Service,
    /// Hand over to the application right away.
    Launch(EntryPoint),
}

/// The resident updater: session, engine, persistent store and board.
pub struct Updater<F: Flash, S: Storage, B: Board> {
    config: Config,
    engine: Engine<F>,
    store: S,
    board: B,
    session: Session,
    /// Next page written when the layout carries no address.
    write_cursor: Address,
    /// Next page returned to a report read.
    read_cursor: Address,
    idle_polls: u16,
    left: bool,
}

impl<F: Flash, S: Storage, B: Board> Updater<F, S, B> {
    pub fn new(config: Config, flash: F, store: S, board: B) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            engine: Engine::new(flash, config.geometry, config.secondary_vector),
            config,
            store,
            board,
            session: Session::new(),
            write_cursor: 0,
            read_cursor: 0,
            idle_polls: 0,
            left: false,
        })
    }

    pub fn engine(&self) -> &Engine<F> {
        &self.engine
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Cold boot: repair the vector table if needed and decide whether to stay.
    pub fn start(&mut self) -> Start {
        if !self.engine.vectors_intact() {
            log::warn!("vector table does not lead into the updater, rewriting first page");
            let _guard = Suspended::new(&mut self.board);
            self.engine.initial_page();
        }

        let signal = self.config.entry_signal_pin.is_some() && self.board.entry_signal();
        let empty = !self.engine.application_installed();
        let requested = self.board.reentry_marker();

        if signal || empty || requested {
            log::info!(
                "entering update mode (signal: {}, empty: {}, requested: {})",
                signal,
                empty,
                requested
            );
            self.board.set_reentry_marker(true);
            Start::Service
        } else {
            let entry = self.engine.application_entry();
            log::info!("launching application at {:?}", entry);
            Start::Launch(entry)
        }
    }

    /// One loop iteration, after the transport was polled.
    ///
    /// Executes the pending command once its countdown expires. Returns the application
    /// entry when update mode ends.
    pub fn tick(&mut self) -> Option<EntryPoint> {
        if self.left {
            return None;
        }
        self.idle_polls = self.idle_polls.saturating_add(1);

        if let Some(command) = self.session.tick() {
            let leave = self.execute(command);
            self.session.finish();
            if leave {
                return Some(self.leave());
            }
        }

        if let Some(limit) = self.config.idle_exit {
            if self.idle_polls >= limit
                && !self.session.is_busy()
                && self.engine.application_installed()
            {
                log::info!("no host activity for {} polls", limit);
                return Some(self.leave());
            }
        }
        None
    }

    /// Service the host until update mode ends, returning where to continue.
    pub fn run<T: Transport, D: DelayNs>(
        &mut self,
        transport: &mut T,
        delay: &mut D,
    ) -> EntryPoint {
        if let Start::Launch(entry) = self.start() {
            return entry;
        }
        loop {
            transport.poll(self);
            if let Some(entry) = self.tick() {
                return entry;
            }
            delay.delay_us(self.config.poll_interval_us);
        }
    }

    /// Service the host, then continue at the application entry.
    ///
    /// # Safety
    ///
    /// Same contract as [`Boot::boot`].
    pub unsafe fn serve<BT: Boot, T: Transport, D: DelayNs>(
        mut self,
        transport: &mut T,
        delay: &mut D,
    ) -> ! {
        let entry = self.run(transport, delay);
        unsafe { BT::boot(entry) }
    }

    fn execute(&mut self, command: Command) -> bool {
        let opcode = command.opcode;
        log::info!("executing {:?}", opcode);
        if self.config.status_indicator.is_some() {
            self.board.indicate(true);
        }

        if opcode.contains(Opcode::ERASE) {
            self.erase_application();
            // Without an address the write that follows lands on the first page.
            let rewrites_first_page =
                opcode.contains(Opcode::WRITE) && command.address.unwrap_or(0) == 0;
            if !rewrites_first_page {
                let _guard = Suspended::new(&mut self.board);
                self.engine.initial_page();
            }
        }

        if opcode.contains(Opcode::WRITE) {
            let target = command.address.unwrap_or(self.write_cursor);
            match self.config.geometry.page(target) {
                Ok(page) => self.write(page),
                Err(e) => log::warn!("dropping write to {:#x}: {:?}", target, e),
            }
        }

        if opcode.contains(Opcode::ERASE_STORE) {
            if let Err(e) = self.erase_store() {
                log::warn!("persistent store wipe failed: {:?}", e);
            }
        }

        if self.config.status_indicator.is_some() {
            self.board.indicate(false);
        }
        opcode.contains(Opcode::LEAVE)
    }

    /// Erase application pages from the top down. The first page is left to the caller,
    /// which reprograms it as one unit.
    fn erase_application(&mut self) {
        for page in self.config.geometry.application_pages() {
            if page == self.config.geometry.first_page() {
                break;
            }
            let _guard = Suspended::new(&mut self.board);
            self.engine.erase_page(page);
        }
        self.write_cursor = 0;
    }

    fn write(&mut self, page: PageAddress) {
        let layout = self.config.layout;
        let payload = &self.session.report()[layout.data..];
        {
            let _guard = Suspended::new(&mut self.board);
            self.engine.program_page(page, payload);
        }
        self.write_cursor = page.addr() + Address::from(self.config.geometry.page_size);
    }

    fn erase_store(&mut self) -> Result<(), Error> {
        let erased = [0xffu8];
        for offset in 0..self.store.capacity() {
            self.store
                .write(offset as u32, &erased)
                .map_err(|_| Error::Storage)?;
        }
        Ok(())
    }

    fn leave(&mut self) -> EntryPoint {
        self.left = true;
        self.board.set_reentry_marker(false);
        self.board.teardown();
        // Stays suspended: the application enables what it needs.
        self.board.suspend();
        let entry = self.engine.application_entry();
        log::info!("leaving update mode for {:?}", entry);
        entry
    }

    fn read_reply(&mut self) -> usize {
        let layout = self.config.layout;
        let geometry = self.config.geometry;
        let len = self.config.report_len();
        let addr = self.read_cursor;

        let report = self.session.reply_buffer(len);
        self.engine.flash().read(addr, &mut report[layout.data..]);
        layout.seal(Opcode::READ, Some(addr), report);

        let next = addr + Address::from(geometry.page_size);
        self.read_cursor = if next >= geometry.flash_size { 0 } else { next };
        len
    }
}

impl<F: Flash, S: Storage, B: Board> Callbacks for Updater<F, S, B> {
    fn on_setup(&mut self, request: &SetupRequest) -> Result<SetupResponse<'_>, Error> {
        self.idle_polls = 0;
        if !request.is_class() {
            return Ok(SetupResponse::NoData);
        }

        match request.request {
            GET_REPORT if self.config.supports_flash_read => {
                if self.session.is_busy() {
                    return Err(Error::Busy);
                }
                let len = self.read_reply();
                Ok(SetupResponse::Reply(self.session.reply(len)))
            }
            SET_REPORT => {
                if !self.session.begin(self.config.report_len()) {
                    log::warn!("transaction refused, command still pending");
                    return Err(Error::Busy);
                }
                Ok(SetupResponse::Receive)
            }
            _ => Ok(SetupResponse::NoData),
        }
    }

    fn on_chunk_write(&mut self, chunk: &[u8]) -> ChunkStatus {
        match self.session.append(chunk) {
            None => return ChunkStatus::Error,
            Some(false) => return ChunkStatus::Continue,
            Some(true) => {}
        }

        let parsed = self
            .config
            .layout
            .parse(self.session.report())
            .and_then(|command| {
                if self.config.opcodes().contains(command.opcode) {
                    Ok(command)
                } else {
                    Err(Error::Unsupported)
                }
            });

        match parsed {
            Ok(command) if command.opcode == Opcode::READ => {
                self.read_cursor = 0;
                self.session.close();
                ChunkStatus::Complete
            }
            Ok(command) => {
                self.session.dispatch(command, self.config.countdown);
                ChunkStatus::Complete
            }
            Err(e) => {
                log::warn!("report rejected: {:?}", e);
                self.engine.discard();
                self.session.reject();
                ChunkStatus::Error
            }
        }
    }
}
