//! Unpacking the modules shipped with the host.
//!
//! The bundled archive is unpacked into its own directory only when the
//! directory does not already mirror it. "Mirror" means the same set of
//! relative file names with the same modification times; file contents are
//! never compared.

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};
use zip::ZipArchive;

/// Bundled archive error types
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BundleError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid bundled archive {archive}: {source}")]
    Zip {
        archive: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    /// Entry name escapes the target directory.
    #[error("Unsafe entry path '{0}' in bundled archive")]
    UnsafePath(String),
}

/// Relative path → modification time in whole seconds since the epoch.
type Listing = BTreeMap<PathBuf, u64>;

/// Unpack `archive` into `dir` unless `dir` already mirrors it.
///
/// Returns `true` when `dir` was wiped and re-extracted.
pub fn conditionally_extract(archive: &Path, dir: &Path) -> Result<bool, BundleError> {
    let file = File::open(archive).map_err(|source| BundleError::Io {
        path: archive.to_path_buf(),
        source,
    })?;
    let mut zip = ZipArchive::new(BufReader::new(file)).map_err(zip_err(archive))?;

    let expected = archive_listing(&mut zip, archive)?;
    if dir.is_dir() && directory_listing(dir)? == expected {
        debug!(archive = %archive.display(), dir = %dir.display(), "bundled modules up to date");
        return Ok(false);
    }

    if dir.exists() {
        fs::remove_dir_all(dir).map_err(io_err(dir))?;
    }
    fs::create_dir_all(dir).map_err(io_err(dir))?;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(zip_err(archive))?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| BundleError::UnsafePath(entry.name().to_string()))?;
        let target = dir.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(io_err(&target))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let mut out = File::create(&target).map_err(io_err(&target))?;
        io::copy(&mut entry, &mut out).map_err(io_err(&target))?;
        if let Some(modified) = entry.last_modified().and_then(to_system_time) {
            out.set_modified(modified).map_err(io_err(&target))?;
        }
    }

    info!(archive = %archive.display(), dir = %dir.display(), files = expected.len(), "extracted bundled modules");
    Ok(true)
}

fn archive_listing<R: io::Read + io::Seek>(zip: &mut ZipArchive<R>, archive: &Path) -> Result<Listing, BundleError> {
    let mut listing = Listing::new();
    for index in 0..zip.len() {
        let entry = zip.by_index(index).map_err(zip_err(archive))?;
        if entry.is_dir() {
            continue;
        }
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| BundleError::UnsafePath(entry.name().to_string()))?;
        let stamp = entry
            .last_modified()
            .and_then(to_system_time)
            .map_or(0, epoch_seconds);
        listing.insert(relative, stamp);
    }
    Ok(listing)
}

fn directory_listing(dir: &Path) -> Result<Listing, BundleError> {
    let mut listing = Listing::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current).map_err(io_err(&current))? {
            let entry = entry.map_err(io_err(&current))?;
            let path = entry.path();
            let meta = entry.metadata().map_err(io_err(&path))?;
            if meta.is_dir() {
                pending.push(path);
                continue;
            }
            let modified = meta.modified().map_err(io_err(&path))?;
            if let Ok(relative) = path.strip_prefix(dir) {
                listing.insert(relative.to_path_buf(), epoch_seconds(modified));
            }
        }
    }
    Ok(listing)
}

/// Zip timestamps carry no zone; they are read as UTC consistently.
fn to_system_time(stamp: zip::DateTime) -> Option<SystemTime> {
    let naive = NaiveDate::from_ymd_opt(stamp.year().into(), stamp.month().into(), stamp.day().into())?
        .and_hms_opt(stamp.hour().into(), stamp.minute().into(), stamp.second().into())?;
    Some(naive.and_utc().into())
}

fn epoch_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> BundleError + '_ {
    move |source| BundleError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn zip_err(archive: &Path) -> impl FnOnce(zip::result::ZipError) -> BundleError + '_ {
    move |source| BundleError::Zip {
        archive: archive.to_path_buf(),
        source,
    }
}
