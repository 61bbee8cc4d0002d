//! Chip identification through the flashing tool

use log::debug;

use crate::{
    serial::ChipProbe,
    targets::Chip,
    tool::{FlashTool, PortLocks, ToolCommand, Verb},
};

/// Baud rate used to talk to a device whose chip is not yet known
pub const DEFAULT_BAUD: u32 = 115_200;
/// Baud rate ESP32-family devices are flashed with unless configured otherwise
pub const FAST_BAUD: u32 = 460_800;

/// Ask the device on `port` to identify itself
///
/// The device is left running the loader rather than being reset. Returns the
/// tool's combined output, or `None` if it printed nothing at all. The
/// diagnostic of a faulted run never names a chip, so it classifies as
/// [Chip::Unknown].
pub fn probe(tool: &dyn FlashTool, locks: &PortLocks, port: &str, baud: u32) -> Option<String> {
    let invocation = ToolCommand::new(Verb::ChipId)
        .port(port)
        .baud(baud)
        .no_reset()
        .run(tool, locks, &mut |_| {});

    debug!("Probe of {port} exited with {}", invocation.code);

    Some(invocation.output).filter(|output| !output.is_empty())
}

/// Classify probe output, treating a failed probe as an unknown chip
pub fn classify(output: Option<&str>) -> Chip {
    output.map(Chip::classify).unwrap_or_default()
}

/// [ChipProbe] backed by the flashing tool
pub struct Prober<'a> {
    tool: &'a dyn FlashTool,
    locks: &'a PortLocks,
    baud: u32,
}

impl<'a> Prober<'a> {
    pub fn new(tool: &'a dyn FlashTool, locks: &'a PortLocks, baud: u32) -> Self {
        Self { tool, locks, baud }
    }
}

impl ChipProbe for Prober<'_> {
    fn detect(&self, port: &str) -> Chip {
        classify(probe(self.tool, self.locks, port, self.baud).as_deref())
    }
}

/// The baud rate to use once `chip` has been identified
///
/// ESP32-family chips are fast enough for [FAST_BAUD], so slower configured
/// rates are raised to it.
pub fn effective_baud(chip: Chip, baud: u32) -> u32 {
    if chip.is_esp32_family() && baud <= DEFAULT_BAUD {
        FAST_BAUD
    } else {
        baud
    }
}
