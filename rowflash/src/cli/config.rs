//! Command-line interface configuration
//!
//! Settings are read from a `rowflash.toml` file, looked up in the current
//! directory, then its parent, and finally in the user's configuration
//! directory. The file is never written. Every setting is optional and
//! command-line arguments take precedence over it.

use std::{
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::Deserialize;

use crate::{
    error::Error,
    release::{RetryPolicy, DEFAULT_ENDPOINT},
    tool::DEFAULT_PROGRAM,
};

const CONFIG_FILE_NAME: &str = "rowflash.toml";

/// A configured, known serial connection
#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Connection {
    /// Name of the serial port used for communication
    pub serial: Option<String>,
    /// Baud rate used for communication
    pub baud: Option<u32>,
}

/// The external flashing tool
#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ToolConfig {
    /// Executable to run, e.g. `esptool.py`
    pub program: Option<String>,
}

/// Where precompiled firmware is published
#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ReleaseConfig {
    /// Endpoint returning the latest release
    pub endpoint: Option<String>,
    /// Total number of attempts made to fetch the release
    pub retries: Option<u32>,
}

/// Flash settings overriding the chip's defaults
#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct FlashConfig {
    pub mode: Option<String>,
    pub frequency: Option<String>,
}

/// Deserialized contents of a configuration file
#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub connection: Connection,
    pub tool: ToolConfig,
    pub release: ReleaseConfig,
    pub flash: FlashConfig,
    /// File the configuration was read from
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load the configuration from the first configuration file found
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load the configuration from `path`; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        let data = match read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No configuration found at {}", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e)
                    .into_diagnostic()
                    .wrap_err_with(|| format!("Failed to read config from {}", path.display()))
            }
        };

        let mut config: Self = toml::from_str(&data)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to parse config at {}", path.display()))?;
        config.path = Some(path.to_path_buf());

        debug!("Config: {config:#?}");

        Ok(config)
    }

    /// Executable of the flashing tool
    pub fn program(&self) -> &str {
        self.tool.program.as_deref().unwrap_or(DEFAULT_PROGRAM)
    }

    /// Endpoint of the latest firmware release
    pub fn endpoint(&self) -> &str {
        self.release.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT)
    }

    /// Retry behaviour for fetching release metadata
    pub fn retry_policy(&self) -> RetryPolicy {
        let default = RetryPolicy::default();

        RetryPolicy {
            attempts: self.release.retries.unwrap_or(default.attempts).max(1),
            ..default
        }
    }

    fn config_path() -> Result<PathBuf, Error> {
        let local_config = std::env::current_dir()?.join(CONFIG_FILE_NAME);
        if local_config.exists() {
            return Ok(local_config);
        }
        if let Some(parent_folder) = std::env::current_dir()?.parent() {
            let workspace_config = parent_folder.join(CONFIG_FILE_NAME);
            if workspace_config.exists() {
                return Ok(workspace_config);
            }
        }

        // Without a home directory there is no global configuration either.
        Ok(ProjectDirs::from("rs", "rowflash", "rowflash")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
            .unwrap_or(local_config))
    }
}
