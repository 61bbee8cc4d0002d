//! Firmware provisioning for ESP Rowing Monitor devices
//!
//! `rowflash` finds the serial port a device is attached to, identifies its
//! chip, resolves a compatible precompiled firmware release (or maps a
//! directory of custom build artifacts to flash addresses) and drives
//! [esptool] to write it, reporting progress along the way.
//!
//! The flashing tool itself is an opaque external program; see the [tool]
//! module for how it is invoked.
//!
//! [esptool]: https://github.com/espressif/esptool

pub use self::{error::Error, targets::Chip};

#[cfg(feature = "cli")]
pub mod cli;
pub mod download;
pub mod error;
pub mod flash_map;
pub mod probe;
pub mod progress;
pub mod release;
pub mod serial;
pub mod targets;
pub mod tool;
pub mod worker;

/// Logging utilities
#[cfg(feature = "cli")]
pub mod logging {
    use env_logger::{Builder, Env};
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
