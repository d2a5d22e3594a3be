//! Deployment scanning
//!
//! A [`Scanner`] reports which deployment units appeared or changed since the
//! previous scan. Change detection is timestamp based: the same path with a
//! newer modification time is reported again as a new unit.

mod poller;

pub use poller::ScanPoller;

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use hotswap_kernel::FrameworkConfig;

use crate::deployment::DeploymentUnit;

/// Scanner error types
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScanError {
    /// A removal could not be made durable; the unit would reappear after a restart.
    #[error("Cannot durably remove {path}: {source}")]
    DurabilityFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to scan {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Source of deployment units.
pub trait Scanner: Send + Sync {
    /// Units not returned by any previous scan. The first call returns
    /// everything currently present.
    fn scan(&self) -> Result<Vec<DeploymentUnit>, ScanError>;

    /// Every unit currently tracked, without scanning.
    fn deployment_units(&self) -> Vec<DeploymentUnit>;

    /// Forget all tracked units; the next scan behaves like the first.
    fn reset(&self);

    /// Remove a unit so that no later scan, in this process or after a
    /// restart, reports it again.
    fn remove(&self, unit: &DeploymentUnit) -> Result<(), ScanError>;
}

/// Scanner over one flat directory.
///
/// Hidden files (leading `.`) are ignored, which also keeps installer
/// backups out of the results. The tracking map stays locked for the whole
/// scan, so concurrent scans of one scanner are serialized.
#[derive(Debug)]
pub struct DirectoryScanner {
    directory: PathBuf,
    extensions: Vec<String>,
    tracked: Mutex<BTreeMap<PathBuf, DeploymentUnit>>,
}

impl DirectoryScanner {
    pub fn new(directory: impl Into<PathBuf>, extensions: Vec<String>) -> Self {
        Self {
            directory: directory.into(),
            extensions,
            tracked: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn from_config(config: &FrameworkConfig) -> Self {
        Self::new(config.plugin_dir.clone(), config.artifact_extensions.clone())
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn accepts(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.starts_with('.') {
            return false;
        }
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
    }

    /// Current units on disk keyed by path.
    fn observe(&self) -> Result<BTreeMap<PathBuf, DeploymentUnit>, ScanError> {
        let mut present = BTreeMap::new();

        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(dir = %self.directory.display(), "scan directory does not exist");
                return Ok(present);
            }
            Err(source) => {
                return Err(ScanError::Io {
                    path: self.directory.clone(),
                    source,
                });
            }
        };

        for entry in entries {
            let entry = entry.map_err(|source| ScanError::Io {
                path: self.directory.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() || !self.accepts(&path) {
                continue;
            }
            match DeploymentUnit::from_file(&path) {
                Ok(unit) => {
                    present.insert(path, unit);
                }
                // Deleted between listing and stat: it simply isn't there.
                Err(e) => debug!(path = %path.display(), error = %e, "skipping vanished artifact"),
            }
        }

        Ok(present)
    }
}

impl Scanner for DirectoryScanner {
    fn scan(&self) -> Result<Vec<DeploymentUnit>, ScanError> {
        let mut tracked = self.tracked.lock();
        let present = self.observe()?;

        let new_units: Vec<DeploymentUnit> = present
            .values()
            .filter(|unit| tracked.get(unit.path()) != Some(*unit))
            .cloned()
            .collect();

        let vanished = tracked.keys().filter(|p| !present.contains_key(*p)).count();
        if vanished > 0 {
            debug!(dir = %self.directory.display(), vanished, "artifacts disappeared since last scan");
        }

        *tracked = present;

        if !new_units.is_empty() {
            info!(dir = %self.directory.display(), count = new_units.len(), "found new deployment units");
        }
        Ok(new_units)
    }

    fn deployment_units(&self) -> Vec<DeploymentUnit> {
        self.tracked.lock().values().cloned().collect()
    }

    fn reset(&self) {
        self.tracked.lock().clear();
    }

    fn remove(&self, unit: &DeploymentUnit) -> Result<(), ScanError> {
        let mut tracked = self.tracked.lock();
        let path = unit.path();

        match fs::remove_file(path) {
            Ok(()) => info!(path = %path.display(), "removed deployment unit"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "deployment unit already gone");
            }
            Err(source) => {
                if path.exists() {
                    return Err(ScanError::DurabilityFailure {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
        }

        tracked.remove(path);
        Ok(())
    }
}
