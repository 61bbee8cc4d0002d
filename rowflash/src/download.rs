//! Download and extraction of firmware archives

use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info, warn};
use reqwest::blocking::Client;
use tempfile::NamedTempFile;
use zip::ZipArchive;

use crate::{error::TransportError, progress::DownloadCallbacks};

/// Name of the directory archives are extracted into
pub const EXTRACT_DIR: &str = "firmware_extracted";

const CHUNK_SIZE: usize = 8192;
/// Limit for connecting and for every single read, not for the whole transfer
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for firmware downloads
///
/// `timeout` bounds each connect and read operation, so a slow transfer
/// succeeds for as long as data keeps arriving.
pub fn download_client(timeout: Duration) -> Result<Client, TransportError> {
    Ok(Client::builder()
        .use_rustls_tls()
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()?)
}

/// Download the archive at `url` and extract it below `dest_dir`
///
/// Returns the extraction directory, or `None` after reporting the failure
/// through [DownloadCallbacks::status].
pub fn download_and_extract(
    client: &Client,
    url: &str,
    dest_dir: &Path,
    callbacks: &mut dyn DownloadCallbacks,
) -> Option<PathBuf> {
    match try_download_and_extract(client, url, dest_dir, callbacks) {
        Ok(path) => Some(path),
        Err(e) => {
            warn!("Failed to download/extract firmware: {e}");
            callbacks.status(&format!("Error: {e}"));
            None
        }
    }
}

fn try_download_and_extract(
    client: &Client,
    url: &str,
    dest_dir: &Path,
    callbacks: &mut dyn DownloadCallbacks,
) -> Result<PathBuf, TransportError> {
    info!("Downloading firmware from {url}");
    callbacks.status("Downloading...");

    // Removed on drop, whichever way this function exits
    let archive = download(client, url, callbacks)?;

    let target = dest_dir.join(EXTRACT_DIR);
    if target.exists() {
        fs::remove_dir_all(&target)?;
    }
    fs::create_dir_all(&target)?;

    info!("Extracting firmware to {}", target.display());
    callbacks.extract_start();
    callbacks.status("Extracting...");

    extract(archive.path(), &target)?;

    callbacks.status("Ready");
    if let Err(e) = archive.close() {
        warn!("Failed to remove the downloaded archive: {e}");
    }

    Ok(target)
}

fn download(
    client: &Client,
    url: &str,
    callbacks: &mut dyn DownloadCallbacks,
) -> Result<NamedTempFile, TransportError> {
    let mut response = client
        .get(url)
        .send()?
        .error_for_status()?;

    let total = response.content_length().unwrap_or(0);
    let mut file = tempfile::Builder::new()
        .prefix("rowflash-")
        .suffix(".zip")
        .tempfile()?;

    let mut buffer = [0u8; CHUNK_SIZE];
    let mut done = 0u64;
    loop {
        let len = match response.read(&mut buffer) {
            Ok(0) => break,
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        file.write_all(&buffer[..len])?;
        done += len as u64;

        if total > 0 {
            callbacks.progress(done, total);
        }
    }
    file.flush()?;

    debug!("Downloaded {done} bytes to {}", file.path().display());

    Ok(file)
}

/// Extract every entry of the ZIP archive at `archive` into `target`
///
/// Entries whose names would place them outside of `target` are rejected.
pub fn extract(archive: &Path, target: &Path) -> Result<(), TransportError> {
    let mut archive = ZipArchive::new(File::open(archive)?)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("archive entry '{}' escapes the extraction directory", entry.name()),
            )
        })?;

        let path = target.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&path)?;
            continue;
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        io::copy(&mut entry, &mut File::create(&path)?)?;
    }

    Ok(())
}
