//! Resolution of precompiled firmware releases
//!
//! Releases are published with one ZIP archive per supported combination of
//! rower profile, board and chip, named
//! `firmware_{rower}-{board}_{chip}.zip`. This module fetches the metadata of
//! the latest release and works out which archives suit a given device.

use std::{collections::BTreeSet, sync::LazyLock, thread, time::Duration};

use log::{debug, warn};
use regex::Regex;
use reqwest::{
    blocking::Client,
    header::{ACCEPT, USER_AGENT},
    StatusCode,
};
use serde::Deserialize;

use crate::{
    error::{Error, TransportError},
    targets::Chip,
};

/// Endpoint returning the latest firmware release
pub const DEFAULT_ENDPOINT: &str =
    "https://api.github.com/repos/Abasz/ESPRowingMonitor/releases/latest";

const ACCEPT_GITHUB_JSON: &str = "application/vnd.github.v3+json";
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

static RE_ASSET_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^firmware_([^-]+)-([^_]+)_(.+)$").unwrap());

/// Downloadable file attached to a release
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseAsset {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "browser_download_url", default)]
    pub download_url: String,
}

impl ReleaseAsset {
    pub fn key(&self) -> Option<AssetKey> {
        parse_asset_name(&self.name)
    }
}

/// A release and its assets, as fetched
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseSnapshot {
    #[serde(rename = "tag_name")]
    pub tag: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// The combination of profiles a firmware archive was built for
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetKey {
    pub rower: String,
    pub board: String,
    /// Lower-cased chip identifier, e.g. `esp32s3`
    pub chip: String,
}

/// Source of release metadata
pub trait ReleaseApi {
    /// Fetch the release described at `endpoint`, in a single attempt
    fn latest_release(&self, endpoint: &str) -> Result<ReleaseSnapshot, TransportError>;
}

/// Release metadata from the GitHub REST API
#[derive(Debug, Clone)]
pub struct GithubClient {
    http: Client,
}

impl GithubClient {
    pub fn new() -> Result<Self, TransportError> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(METADATA_TIMEOUT)
            .build()?;

        Ok(Self { http })
    }
}

impl ReleaseApi for GithubClient {
    fn latest_release(&self, endpoint: &str) -> Result<ReleaseSnapshot, TransportError> {
        let response = self
            .http
            .get(endpoint)
            .header(ACCEPT, ACCEPT_GITHUB_JSON)
            .header(USER_AGENT, concat!("rowflash/", env!("CARGO_PKG_VERSION")))
            .send()?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(TransportError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_owned(),
            });
        }

        Ok(response.json()?)
    }
}

/// How often, and how patiently, to retry a failed fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub attempts: u32,
    /// Pause between two attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(3),
        }
    }
}

/// Fetch the latest release, retrying transport failures
///
/// A failed fetch never yields stale data: the error carries the message of
/// the last failed attempt.
pub fn fetch_latest(
    api: &dyn ReleaseApi,
    endpoint: &str,
    policy: &RetryPolicy,
) -> Result<ReleaseSnapshot, Error> {
    let attempts = policy.attempts.max(1);
    let mut last_error = String::from("Max retries exceeded");

    for attempt in 1..=attempts {
        debug!("Fetching {endpoint} (attempt {attempt}/{attempts})");

        match api.latest_release(endpoint) {
            Ok(snapshot) => {
                debug!(
                    "Release {} has {} asset(s)",
                    snapshot.tag,
                    snapshot.assets.len()
                );
                return Ok(snapshot);
            }
            Err(e) => {
                last_error = format!("Attempt {attempt}/{attempts} failed: {}", describe(&e));
                warn!("{last_error}");

                if attempt < attempts {
                    thread::sleep(policy.delay);
                }
            }
        }
    }

    Err(Error::ReleaseUnavailable(last_error))
}

fn describe(error: &TransportError) -> String {
    match error {
        TransportError::Status { .. } => error.to_string(),
        _ => format!("Unexpected error: {}: {error}", error.kind()),
    }
}

/// Split an archive name into its rower, board and chip
///
/// Only `.zip` archives (in any letter case) are recognised.
pub fn parse_asset_name(name: &str) -> Option<AssetKey> {
    let split = name.len().checked_sub(4)?;
    let (stem, extension) = (name.get(..split)?, name.get(split..)?);
    if !extension.eq_ignore_ascii_case(".zip") {
        return None;
    }

    let caps = RE_ASSET_NAME.captures(stem)?;

    Some(AssetKey {
        rower: caps[1].to_owned(),
        board: caps[2].to_owned(),
        chip: caps[3].to_lowercase(),
    })
}

/// Boards with firmware for both `chip` and `rower`, sorted and unique
pub fn compatible_boards(assets: &[ReleaseAsset], chip: Chip, rower: &str) -> Vec<String> {
    if !chip.is_known() {
        return Vec::new();
    }

    let chip = chip.to_string();
    assets
        .iter()
        .filter_map(ReleaseAsset::key)
        .filter(|key| key.chip.eq_ignore_ascii_case(&chip) && key.rower == rower)
        .map(|key| key.board)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Every rower profile the release has firmware for, sorted and unique
pub fn rower_profiles(snapshot: &ReleaseSnapshot) -> Vec<String> {
    snapshot
        .assets
        .iter()
        .filter_map(ReleaseAsset::key)
        .map(|key| key.rower)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// The archive built for exactly this rower, board and chip
pub fn find_asset<'a>(
    snapshot: &'a ReleaseSnapshot,
    rower: &str,
    board: &str,
    chip: Chip,
) -> Option<&'a ReleaseAsset> {
    let chip = chip.to_string();
    snapshot.assets.iter().find(|asset| {
        asset.key().is_some_and(|key| {
            key.rower == rower && key.board == board && key.chip.eq_ignore_ascii_case(&chip)
        })
    })
}

/// Turn a camel-case profile name into words, e.g. `genericAir` into
/// `Generic Air`
pub fn format_profile_name(raw: &str) -> String {
    let chars = raw.chars().collect::<Vec<_>>();
    let mut spaced = String::with_capacity(raw.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if i > 0 && c.is_ascii_uppercase() {
            let prev = chars[i - 1];
            let next = chars.get(i + 1).copied();

            let after_lower = prev.is_ascii_lowercase() || prev.is_ascii_digit();
            let starts_word =
                prev.is_ascii_uppercase() && next.is_some_and(|n| n.is_ascii_lowercase());

            if after_lower || starts_word {
                spaced.push(' ');
            }
        }
        spaced.push(c);
    }

    spaced
        .split_whitespace()
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}
