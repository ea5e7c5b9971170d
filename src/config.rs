//! Build-time configuration of the updater.

use crate::{
    Address, Error,
    flash::Geometry,
    protocol::{Opcode, ReportLayout, session::MAX_REPORT_LEN},
    vectors::{Rjmp, VectorTable},
};

/// General purpose I/O pin number.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Pin(pub u8);

/// Everything the updater is built with, constructed once and handed to [`crate::Updater`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    pub geometry: Geometry,
    pub layout: ReportLayout,
    /// Offset of the second intercepted hardware vector.
    pub secondary_vector: Address,
    /// Answer report reads with program memory pages.
    pub supports_flash_read: bool,
    /// Accept the command wiping the persistent data store.
    pub supports_store_erase: bool,
    /// Accept the command leaving the updater for the application.
    pub supports_software_exit: bool,
    /// Lit while a command executes.
    pub status_indicator: Option<Pin>,
    /// Pin forcing update mode at boot when asserted.
    pub entry_signal_pin: Option<Pin>,
    /// Loop iterations between accepting a command and executing it.
    pub countdown: u8,
    /// Pause between two transport polls.
    pub poll_interval_us: u32,
    /// Leave for an installed application after this many polls without host requests.
    pub idle_exit: Option<u16>,
}

impl Config {
    /// Defaults of an 8 KiB part with 64-byte pages and a 2 KiB updater.
    pub const fn new() -> Self {
        Self {
            geometry: Geometry {
                page_size: 64,
                flash_size: 0x2000,
                loader_start: 0x1800,
            },
            layout: ReportLayout::reduced(),
            secondary_vector: 4,
            supports_flash_read: true,
            supports_store_erase: true,
            supports_software_exit: true,
            status_indicator: Some(Pin(4)),
            entry_signal_pin: Some(Pin(0)),
            countdown: 10,
            poll_interval_us: 100,
            idle_exit: None,
        }
    }

    pub const fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }

    pub const fn with_layout(mut self, layout: ReportLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.geometry.validate()?;
        self.layout.validate()?;

        if self.report_len() > MAX_REPORT_LEN {
            return Err(Error::InvalidConfig);
        }
        let page = Address::from(self.geometry.page_size);
        if self.secondary_vector == 0
            || self.secondary_vector % 2 != 0
            || self.secondary_vector >= page
        {
            return Err(Error::InvalidConfig);
        }
        if self.countdown == 0 {
            return Err(Error::InvalidConfig);
        }

        // Vectors and shadow slots hold single relative jumps, which must reach anywhere.
        if !Rjmp::wraps(self.geometry.flash_size) {
            return Err(Error::InvalidConfig);
        }
        let table = VectorTable::new(&self.geometry, self.secondary_vector);
        if table.vectors().iter().any(|vector| table.trampoline_jump(vector).is_none()) {
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }

    /// Length of every report exchanged with the host.
    pub const fn report_len(&self) -> usize {
        self.layout.len(self.geometry.page_size)
    }

    /// Opcode flags this build accepts.
    pub fn opcodes(&self) -> Opcode {
        let mut opcodes = Opcode::WRITE | Opcode::ERASE;
        opcodes.set(Opcode::ERASE_STORE, self.supports_store_erase);
        opcodes.set(Opcode::LEAVE, self.supports_software_exit);
        opcodes
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(Config::new().validate(), Ok(()));
        assert_eq!(Config::new().report_len(), 66);
    }

    #[test]
    fn oversized_report() {
        let config = Config::new().with_geometry(Geometry {
            page_size: 256,
            flash_size: 0x2000,
            loader_start: 0x1800,
        });
        assert_eq!(config.validate(), Ok(()));

        let mut layout = ReportLayout::addressed();
        layout.data = 12;
        assert_eq!(config.with_layout(layout).validate(), Err(Error::InvalidConfig));
    }

    #[test]
    fn memory_beyond_jump_reach() {
        let config = Config::new().with_geometry(Geometry {
            page_size: 256,
            flash_size: 0x8000,
            loader_start: 0x7000,
        });
        assert_eq!(config.geometry.validate(), Ok(()));
        assert_eq!(config.validate(), Err(Error::InvalidConfig));

        let config = Config::new().with_geometry(Geometry {
            page_size: 64,
            flash_size: 0x1800,
            loader_start: 0x1000,
        });
        assert_eq!(config.validate(), Err(Error::InvalidConfig));
    }

    #[test]
    fn disabled_opcodes() {
        let mut config = Config::new();
        config.supports_store_erase = false;
        config.supports_software_exit = false;

        assert!(config.opcodes().contains(Opcode::ERASE | Opcode::WRITE));
        assert!(!config.opcodes().intersects(Opcode::ERASE_STORE | Opcode::LEAVE));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn config_survives_postcard() {
        let config = Config::new().with_layout(ReportLayout::addressed());
        let mut buf = [0u8; 64];
        let used = postcard::to_slice(&config, &mut buf).unwrap();
        let decoded: Config = postcard::from_bytes(used).unwrap();
        assert_eq!(decoded, config);
    }
}
