//! Mapping of firmware artifacts to flash addresses
//!
//! A build directory usually contains a bootloader, a partition table and an
//! application image. [from_directory] recognises them by name and assigns
//! each the address it must be written to on the detected chip.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::LazyLock,
};

use directories::UserDirs;
use log::debug;
use regex::Regex;

use crate::{error::Error, targets::Chip};

const BOOTLOADER_FILE_NAMES: &[&str] = &["bootloader.bin", "boot.bin"];
const PARTITION_FILE_NAMES: &[&str] = &["partitions.bin"];
const APP_FILE_NAMES: &[&str] = &["firmware.bin", "app.bin", "application.bin", "ota.bin"];

/// Keywords used to rank unrecognised `.bin` files, most important first
const FIRMWARE_FILE_PRIORITY: &[&str] = &[
    "bootloader",
    "boot",
    "partition",
    "partitions",
    "firmware",
    "app",
    "application",
    "ota",
];

static RE_LEADING_ADDR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(0[xX][0-9a-fA-F]+|\d+)\s*:").unwrap());

/// A file to be written at a specific flash address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashEntry {
    pub address: u32,
    pub path: PathBuf,
}

impl FlashEntry {
    pub fn new(address: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            address,
            path: path.into(),
        }
    }

    /// The address as passed to the flashing tool
    pub fn address_text(&self) -> String {
        format!("{:#x}", self.address)
    }
}

impl Display for FlashEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address_text(), self.path.display())
    }
}

impl FromStr for FlashEntry {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_entry(s)
    }
}

/// Build the flash map for the firmware files in `dir`
///
/// Well-known file names are mapped first. If none of them is present, every
/// `.bin` file is ranked by keyword and up to three of them are assigned to
/// the application, partition table and bootloader addresses, in that order.
pub fn from_directory(dir: impl AsRef<Path>, chip: Option<Chip>) -> Result<Vec<FlashEntry>, Error> {
    let raw = dir.as_ref().to_string_lossy();
    let dir = expand_home(strip_quotes(&raw));
    if !dir.is_dir() {
        return Err(Error::InvalidFirmwareDir(raw.into_owned()));
    }

    let files = fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().to_lowercase();
            Some((name, path))
        })
        .collect::<BTreeMap<_, _>>();

    let profile = chip.unwrap_or(Chip::Esp32).flash_profile();
    let mut entries = Vec::new();

    for (names, address) in [
        (BOOTLOADER_FILE_NAMES, profile.bootloader_addr),
        (PARTITION_FILE_NAMES, profile.partition_addr),
        (APP_FILE_NAMES, profile.app_addr),
    ] {
        if let Some(path) = names.iter().find_map(|name| files.get(*name)) {
            entries.push(FlashEntry::new(address, std::path::absolute(path)?));
        }
    }

    if entries.is_empty() {
        let mut bins = files
            .iter()
            .filter(|(name, _)| name.ends_with(".bin"))
            .collect::<Vec<_>>();
        bins.sort_by_key(|(name, _)| priority(name));

        let addresses = [profile.app_addr, profile.partition_addr, profile.bootloader_addr];
        for ((_, path), address) in bins.into_iter().zip(addresses) {
            entries.push(FlashEntry::new(address, std::path::absolute(path)?));
        }
    }

    debug!("Mapped {} file(s) from {}", entries.len(), dir.display());

    Ok(entries)
}

fn priority(name: &str) -> usize {
    FIRMWARE_FILE_PRIORITY
        .iter()
        .position(|token| name.contains(token))
        .unwrap_or(FIRMWARE_FILE_PRIORITY.len())
}

/// Flatten entries into the `[address, path, ...]` form the tool expects
pub fn to_argument_list(entries: &[FlashEntry]) -> Vec<String> {
    entries
        .iter()
        .flat_map(|entry| [entry.address_text(), entry.path.to_string_lossy().into_owned()])
        .collect()
}

/// Ensure every mapped file exists
///
/// Maps may be edited after they were built, so this is checked right before
/// the files are handed to the flashing tool.
pub fn verify(entries: &[FlashEntry]) -> Result<(), Error> {
    if entries.is_empty() {
        return Err(Error::EmptyFlashMap);
    }

    match entries.iter().find(|entry| !entry.path.is_file()) {
        Some(missing) => Err(Error::MissingFile(missing.path.clone())),
        None => Ok(()),
    }
}

/// Parse free-form `address:path` entries straight into tool arguments
pub fn parse_entries<S: AsRef<str>>(texts: &[S]) -> Result<Vec<String>, Error> {
    let entries = texts
        .iter()
        .map(AsRef::as_ref)
        .filter(|text| !text.trim().is_empty())
        .map(parse_entry)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(to_argument_list(&entries))
}

/// Parse a single `address:path` (or `path:address`) entry
pub fn parse_entry(text: &str) -> Result<FlashEntry, Error> {
    let invalid = || Error::InvalidFlashEntry(text.to_owned());
    let s = strip_quotes(text);

    // A leading address is split off at the first colon, so that paths with
    // drive letters stay intact; otherwise the address is expected last.
    let (left, right) = if RE_LEADING_ADDR.is_match(s) {
        s.split_once(':')
    } else {
        s.rsplit_once(':')
    }
    .ok_or_else(invalid)?;

    let (left, right) = (left.trim(), right.trim());
    let (address, path) = if is_address(left) {
        (left, right)
    } else if is_address(right) {
        (right, left)
    } else {
        return Err(invalid());
    };

    let path = strip_quotes(path);
    if path.is_empty() {
        return Err(invalid());
    }

    Ok(FlashEntry::new(
        parse_address(address)?,
        std::path::absolute(expand_home(path))?,
    ))
}

/// Parse a hexadecimal (`0x...`) or decimal flash address
pub fn parse_address(text: &str) -> Result<u32, Error> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) if !hex.is_empty() && hex.bytes().all(|b| b.is_ascii_hexdigit()) => {
            u32::from_str_radix(hex, 16)
        }
        Some(_) => return Err(Error::InvalidAddress(text.to_owned())),
        None if is_decimal(text) => text.parse(),
        None => return Err(Error::InvalidAddress(text.to_owned())),
    };

    parsed.map_err(|_| Error::InvalidAddress(text.to_owned()))
}

fn is_address(token: &str) -> bool {
    token.starts_with("0x") || token.starts_with("0X") || is_decimal(token)
}

fn is_decimal(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

/// Remove one level of matching surrounding quotes
fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = s
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner.trim();
        }
    }
    s
}

fn expand_home(path: &str) -> PathBuf {
    let home = || UserDirs::new().map(|dirs| dirs.home_dir().to_path_buf());

    if path == "~" {
        if let Some(home) = home() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home() {
            return home.join(rest);
        }
    }

    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn firmware_dir(names: &[&str]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            fs::write(dir.path().join(name), b"\xe9").unwrap();
        }
        dir
    }

    fn mapped(entries: &[FlashEntry]) -> Vec<(u32, String)> {
        entries
            .iter()
            .map(|e| {
                (
                    e.address,
                    e.path.file_name().unwrap().to_string_lossy().into_owned(),
                )
            })
            .collect()
    }

    #[test]
    fn maps_well_known_names_for_esp32() {
        let dir = firmware_dir(&["bootloader.bin", "partitions.bin", "firmware.bin"]);
        let entries = from_directory(dir.path(), Some(Chip::Esp32)).unwrap();

        assert_eq!(
            mapped(&entries),
            vec![
                (0x1000, "bootloader.bin".to_owned()),
                (0x8000, "partitions.bin".to_owned()),
                (0x10000, "firmware.bin".to_owned()),
            ]
        );
        assert!(entries.iter().all(|e| e.path.is_absolute()));
        assert_eq!(entries[0].address_text(), "0x1000");
    }

    #[test]
    fn variants_use_bootloader_at_zero() {
        let dir = firmware_dir(&["boot.bin", "partitions.bin", "app.bin", "readme.txt"]);
        let entries = from_directory(dir.path(), Some(Chip::Esp32s3)).unwrap();

        assert_eq!(
            mapped(&entries),
            vec![
                (0x0, "boot.bin".to_owned()),
                (0x8000, "partitions.bin".to_owned()),
                (0x10000, "app.bin".to_owned()),
            ]
        );
    }

    #[test]
    fn names_match_case_insensitively_and_partial_maps_are_valid() {
        let dir = firmware_dir(&["Firmware.BIN"]);
        let entries = from_directory(dir.path(), None).unwrap();

        assert_eq!(mapped(&entries), vec![(0x10000, "Firmware.BIN".to_owned())]);
    }

    #[test]
    fn first_candidate_name_wins() {
        let dir = firmware_dir(&["ota.bin", "application.bin", "app.bin", "firmware.bin"]);
        let entries = from_directory(dir.path(), Some(Chip::Esp32)).unwrap();

        assert_eq!(mapped(&entries), vec![(0x10000, "firmware.bin".to_owned())]);
    }

    #[test]
    fn fallback_ranks_unrecognised_bins() {
        let dir = firmware_dir(&["unnamed_app.bin", "unnamed_ota.bin"]);
        let entries = from_directory(dir.path(), Some(Chip::Esp32)).unwrap();

        assert_eq!(
            mapped(&entries),
            vec![
                (0x10000, "unnamed_app.bin".to_owned()),
                (0x8000, "unnamed_ota.bin".to_owned()),
            ]
        );
    }

    #[test]
    fn fallback_assigns_at_most_three_files() {
        let dir = firmware_dir(&[
            "my_partition_table.bin",
            "zz.bin",
            "my_bootloader.bin",
            "rower_firmware.bin",
            "notes.md",
        ]);
        let entries = from_directory(dir.path(), Some(Chip::Esp32c3)).unwrap();

        // The best ranked file is treated as the application image
        assert_eq!(
            mapped(&entries),
            vec![
                (0x10000, "my_bootloader.bin".to_owned()),
                (0x8000, "my_partition_table.bin".to_owned()),
                (0x0, "rower_firmware.bin".to_owned()),
            ]
        );
    }

    #[test]
    fn empty_directory_yields_empty_map() {
        let dir = firmware_dir(&["notes.txt"]);
        assert!(from_directory(dir.path(), None).unwrap().is_empty());
    }

    #[test]
    fn rejects_missing_directories() {
        let dir = firmware_dir(&["firmware.bin"]);

        let missing = dir.path().join("nope");
        assert!(matches!(
            from_directory(&missing, None),
            Err(Error::InvalidFirmwareDir(_))
        ));

        let file = dir.path().join("firmware.bin");
        assert!(matches!(
            from_directory(&file, None),
            Err(Error::InvalidFirmwareDir(_))
        ));
    }

    #[test]
    fn quoted_directories_are_accepted() {
        let dir = firmware_dir(&["firmware.bin"]);
        let quoted = format!("\"{}\"", dir.path().display());

        assert_eq!(from_directory(quoted, None).unwrap().len(), 1);
    }

    #[test]
    fn argument_list_from_free_form_entries() {
        assert_eq!(
            parse_entries(&["0x1000:/a/b.bin"]).unwrap(),
            vec!["0x1000", "/a/b.bin"]
        );
        assert_eq!(
            parse_entries(&["/a/b.bin:0x1000"]).unwrap(),
            vec!["0x1000", "/a/b.bin"]
        );
        assert_eq!(
            parse_entries(&["  '0x8000 : /fw/partitions.bin'  ", "", "65536:/fw/app.bin"]).unwrap(),
            vec!["0x8000", "/fw/partitions.bin", "0x10000", "/fw/app.bin"]
        );
    }

    #[test]
    fn leading_address_keeps_colons_in_path() {
        let entry = parse_entry("0x0:C:/fw/boot.bin").unwrap();
        assert_eq!(entry.address, 0);
        assert!(entry.path.to_string_lossy().ends_with("C:/fw/boot.bin"));
    }

    #[test]
    fn invalid_entries() {
        for text in ["/a/b.bin", "/a/b.bin:/c/d.bin", "bootloader:app", "0x1000:", "0xZZ:/a.bin"] {
            assert!(parse_entry(text).is_err(), "{text}");
        }

        assert!(matches!(
            parse_entry("firmware.bin"),
            Err(Error::InvalidFlashEntry(_))
        ));
        assert!(matches!(
            parse_entry("0x100000000:/a.bin"),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn addresses() {
        assert_eq!(parse_address("0x10000").unwrap(), 0x10000);
        assert_eq!(parse_address("0X8000").unwrap(), 0x8000);
        assert_eq!(parse_address("4096").unwrap(), 0x1000);
        assert!(parse_address("").is_err());
        assert!(parse_address("-1").is_err());
        assert!(parse_address("0x").is_err());
        assert!(parse_address("1e3").is_err());
    }

    #[test]
    fn signed_hex_addresses_are_rejected() {
        assert!(matches!(
            parse_address("0x+10"),
            Err(Error::InvalidAddress(text)) if text == "0x+10"
        ));
        assert!(parse_address("0x-10").is_err());
        assert!(parse_entry("0x+1000:/fw/bootloader.bin").is_err());
    }

    #[test]
    fn verify_checks_files_at_consumption_time() {
        let dir = firmware_dir(&["firmware.bin"]);
        let entries = from_directory(dir.path(), None).unwrap();
        assert!(verify(&entries).is_ok());

        fs::remove_file(dir.path().join("firmware.bin")).unwrap();
        assert!(matches!(verify(&entries), Err(Error::MissingFile(_))));
        assert!(matches!(verify(&[]), Err(Error::EmptyFlashMap)));
    }

    #[test]
    fn display_round_trips_through_from_str() {
        let entry = FlashEntry::new(0x8000, "/fw/partitions.bin");
        assert_eq!(entry.to_string(), "0x8000:/fw/partitions.bin");
        assert_eq!(entry.to_string().parse::<FlashEntry>().unwrap(), entry);
    }
}
