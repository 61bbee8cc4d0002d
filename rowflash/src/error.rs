//! Library and application errors

use std::{io, path::PathBuf};

use miette::Diagnostic;
use thiserror::Error;

/// All possible errors returned by rowflash
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Provided firmware directory does not exist or is not a directory: {0}")]
    #[diagnostic(
        code(rowflash::invalid_firmware_dir),
        help("Select a directory containing the compiled .bin files")
    )]
    InvalidFirmwareDir(String),

    #[error("Invalid flash address '{0}'")]
    #[diagnostic(
        code(rowflash::invalid_address),
        help("Addresses must be hexadecimal (0x...) or decimal and fit in 32 bits")
    )]
    InvalidAddress(String),

    #[error("Flash entry must include an address and a path separated by ':' -> {0}")]
    #[diagnostic(
        code(rowflash::invalid_flash_entry),
        help("Use the form `0x10000:firmware.bin` or `firmware.bin:0x10000`")
    )]
    InvalidFlashEntry(String),

    #[error("Mapped file not found: {}", .0.display())]
    #[diagnostic(code(rowflash::missing_file))]
    MissingFile(PathBuf),

    #[error("No files mapped to flash")]
    #[diagnostic(
        code(rowflash::empty_flash_map),
        help("Provide a firmware directory containing .bin files, or add entries with `--entry`")
    )]
    EmptyFlashMap,

    #[error("No serial ports could be detected")]
    #[diagnostic(
        code(rowflash::no_serial),
        help("Make sure you have connected a device to the host system")
    )]
    NoSerial,

    #[error("The chip could not be identified")]
    #[diagnostic(
        code(rowflash::chip_unknown),
        help("Run `rowflash detect`, or pass the chip explicitly with `--chip`")
    )]
    ChipUnknown,

    #[error("Release data is not available: {0}")]
    #[diagnostic(
        code(rowflash::release_unavailable),
        help("Check your network connection, or flash a local build with `--dir`")
    )]
    ReleaseUnavailable(String),

    #[error("No firmware found for {rower}/{board}/{chip}")]
    #[diagnostic(
        code(rowflash::firmware_not_found),
        help("Use `rowflash releases --chip <CHIP> --rower <ROWER>` to list compatible boards")
    )]
    FirmwareNotFound {
        rower: String,
        board: String,
        chip: String,
    },

    #[error("Failed to download or extract the firmware archive")]
    #[diagnostic(code(rowflash::download_failed))]
    DownloadFailed,

    #[error("{verb} failed with exit code {code}")]
    #[diagnostic(code(rowflash::tool_failed))]
    ToolFailed { verb: String, code: i32 },

    #[error("Operation was cancelled by the user")]
    #[diagnostic(code(rowflash::cancelled))]
    Cancelled,

    #[error("A background worker stopped before reporting a result")]
    #[diagnostic(code(rowflash::worker_lost))]
    WorkerLost,

    #[error(transparent)]
    #[diagnostic(code(rowflash::io))]
    Io(#[from] io::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised while talking to a remote HTTP endpoint
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("HTTP {status}: {reason}")]
    #[diagnostic(code(rowflash::http_status))]
    Status { status: u16, reason: String },

    #[error("{0}")]
    #[diagnostic(code(rowflash::http))]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    #[diagnostic(code(rowflash::http_io))]
    Io(#[from] io::Error),

    #[error("{0}")]
    #[diagnostic(code(rowflash::archive))]
    Archive(#[from] zip::result::ZipError),
}

impl TransportError {
    /// Name of the error's category, used when reporting failed attempts
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Status { .. } => "HTTPError",
            TransportError::Http(e) if e.is_timeout() => "Timeout",
            TransportError::Http(e) if e.is_connect() => "ConnectionError",
            TransportError::Http(e) if e.is_decode() => "DecodeError",
            TransportError::Http(_) => "RequestError",
            TransportError::Io(_) => "IOError",
            TransportError::Archive(_) => "ArchiveError",
        }
    }
}

/// A failure inside the flashing tool which prevented it from exiting normally
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ToolFault {
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("process terminated by signal")]
    Signal,

    #[error("{0}")]
    Panic(String),

    #[error("{0}")]
    Other(String),
}
