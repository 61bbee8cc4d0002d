//! Supported target devices
//!
//! Every chip the provisioning flow knows about, how to recognise it in the
//! flashing tool's identification output, and where its firmware artifacts
//! live in flash.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, VariantNames};

/// Bootloader, partition table and application offsets of the original ESP32
const ESP32_BOOT_ADDR: u32 = 0x1000;
/// Newer variants (and the ESP8266) place the bootloader at the start of flash
const VARIANT_BOOT_ADDR: u32 = 0x0000;
const PARTITION_ADDR: u32 = 0x8000;
const APP_ADDR: u32 = 0x10000;

/// All chips which can be identified by the prober
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    Display,
    EnumIter,
    EnumString,
    VariantNames,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Chip {
    /// ESP8266
    Esp8266,
    /// ESP32
    Esp32,
    /// ESP32-S2
    Esp32s2,
    /// ESP32-C3
    Esp32c3,
    /// ESP32-S3
    Esp32s3,
    /// The chip could not be identified
    #[default]
    #[cfg_attr(feature = "cli", value(skip))]
    Unknown,
}

// Variants must be tested before the bare family name, which is a substring
// of every variant's identification text.
static CHIP_PATTERNS: LazyLock<[(Chip, Regex); 5]> = LazyLock::new(|| {
    [
        (Chip::Esp32s3, pattern(r"ESP32[-\s]*S3|ESP32S3")),
        (Chip::Esp32s2, pattern(r"ESP32[-\s]*S2|ESP32S2")),
        (Chip::Esp32c3, pattern(r"ESP32[-\s]*C3|ESP32C3")),
        (Chip::Esp32, pattern(r"\bESP32\b")),
        (Chip::Esp8266, pattern(r"\bESP8266\b")),
    ]
});

fn pattern(re: &str) -> Regex {
    // The patterns are constant and known to be valid.
    Regex::new(&format!("(?i){re}")).unwrap()
}

impl Chip {
    /// Classify the textual output of an identification command
    ///
    /// Returns [Chip::Unknown] when no known chip is mentioned.
    pub fn classify(output: &str) -> Self {
        CHIP_PATTERNS
            .iter()
            .find(|(_, re)| re.is_match(output))
            .map(|(chip, _)| *chip)
            .unwrap_or_default()
    }

    /// Whether the chip has been identified
    pub fn is_known(&self) -> bool {
        *self != Chip::Unknown
    }

    /// Whether the chip belongs to the ESP32 family
    pub fn is_esp32_family(&self) -> bool {
        matches!(
            self,
            Chip::Esp32 | Chip::Esp32s2 | Chip::Esp32c3 | Chip::Esp32s3
        )
    }

    /// Flash layout and settings for this chip
    ///
    /// An unidentified chip uses the original ESP32 layout.
    pub fn flash_profile(&self) -> FlashProfile {
        match self {
            Chip::Esp32 | Chip::Unknown => FlashProfile::ESP32,
            Chip::Esp8266 | Chip::Esp32s2 | Chip::Esp32c3 | Chip::Esp32s3 => FlashProfile::VARIANT,
        }
    }
}

/// Static, per-chip flash configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashProfile {
    pub bootloader_addr: u32,
    pub partition_addr: u32,
    pub app_addr: u32,
    pub flash_mode: &'static str,
    pub flash_freq: &'static str,
}

impl FlashProfile {
    const ESP32: Self = Self::new(ESP32_BOOT_ADDR);
    const VARIANT: Self = Self::new(VARIANT_BOOT_ADDR);

    const fn new(bootloader_addr: u32) -> Self {
        Self {
            bootloader_addr,
            partition_addr: PARTITION_ADDR,
            app_addr: APP_ADDR,
            flash_mode: "dio",
            flash_freq: "40m",
        }
    }
}

impl Default for FlashProfile {
    fn default() -> Self {
        Self::ESP32
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn variants_win_over_family() {
        assert_eq!(Chip::classify("Chip is ESP32-S3 (QFN56)"), Chip::Esp32s3);
        assert_eq!(Chip::classify("Detecting chip type... ESP32-S2"), Chip::Esp32s2);
        assert_eq!(Chip::classify("Chip is ESP32-C3 (QFN32) (revision v0.4)"), Chip::Esp32c3);
        assert_eq!(Chip::classify("chip type: esp32s3"), Chip::Esp32s3);
        assert_eq!(Chip::classify("ESP32 S2"), Chip::Esp32s2);
    }

    #[test]
    fn family_and_legacy_chips() {
        assert_eq!(
            Chip::classify("Chip is ESP32-D0WD-V3 (revision v3.0)"),
            Chip::Esp32
        );
        assert_eq!(Chip::classify("Detecting chip type... ESP32"), Chip::Esp32);
        assert_eq!(Chip::classify("Chip is ESP8266EX"), Chip::Unknown);
        assert_eq!(Chip::classify("Detecting chip type... ESP8266"), Chip::Esp8266);
    }

    #[test]
    fn unrecognised_output_is_unknown() {
        assert_eq!(Chip::classify(""), Chip::Unknown);
        assert_eq!(
            Chip::classify("A fatal error occurred: Failed to connect"),
            Chip::Unknown
        );
        // No word boundary after the family name
        assert_eq!(Chip::classify("ESP32X"), Chip::Unknown);
    }

    #[test]
    fn every_variant_text_classifies_as_itself() {
        for chip in Chip::iter().filter(Chip::is_known) {
            let text = format!("Chip is {}", chip.to_string().to_uppercase());
            assert_eq!(Chip::classify(&text), chip, "{text}");
        }
    }

    #[test]
    fn parse_chip_names() {
        assert_eq!(Chip::from_str("esp32s3").unwrap(), Chip::Esp32s3);
        assert_eq!(Chip::from_str("ESP32C3").unwrap(), Chip::Esp32c3);
        assert!(Chip::from_str("esp32h2").is_err());
        assert_eq!(Chip::Esp32s2.to_string(), "esp32s2");
    }

    #[test]
    fn flash_profiles() {
        let esp32 = Chip::Esp32.flash_profile();
        assert_eq!(
            (esp32.bootloader_addr, esp32.partition_addr, esp32.app_addr),
            (0x1000, 0x8000, 0x10000)
        );

        for chip in [Chip::Esp8266, Chip::Esp32s2, Chip::Esp32c3, Chip::Esp32s3] {
            let profile = chip.flash_profile();
            assert_eq!(profile.bootloader_addr, 0x0);
            assert_eq!(profile.partition_addr, 0x8000);
            assert_eq!(profile.app_addr, 0x10000);
            assert_eq!((profile.flash_mode, profile.flash_freq), ("dio", "40m"));
        }

        assert_eq!(Chip::Unknown.flash_profile(), FlashProfile::default());
    }
}
