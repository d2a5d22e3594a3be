//! Durable storage of [`PersistentState`] snapshots.
//!
//! The file store uses atomic write-then-rename: the snapshot is written to
//! a temporary file in the target directory, `fsync`'d, then renamed over
//! the previous file. A crash before the rename leaves the old snapshot
//! intact.

use error_stack::{Report, ResultExt};
use parking_lot::RwLock;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::FrameworkConfig;
use crate::error::{KernelError, KernelResult};
use crate::module::PersistentState;

/// Errors raised while loading or saving overrides.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to (de)serialize overrides: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed overrides entry: {0}")]
    Format(String),
}

/// Persistence collaborator for enablement overrides and restart markers.
pub trait OverridesStore: Send + Sync {
    fn load(&self) -> Result<PersistentState, PersistenceError>;

    fn save(&self, state: &PersistentState) -> Result<(), PersistenceError>;
}

/// In-process store; state does not survive the process.
#[derive(Debug, Default)]
pub struct MemoryOverridesStore {
    state: RwLock<PersistentState>,
}

impl MemoryOverridesStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistentState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }
}

impl OverridesStore for MemoryOverridesStore {
    fn load(&self) -> Result<PersistentState, PersistenceError> {
        Ok(self.state.read().clone())
    }

    fn save(&self, state: &PersistentState) -> Result<(), PersistenceError> {
        *self.state.write() = state.clone();
        Ok(())
    }
}

/// JSON file store.
#[derive(Debug)]
pub struct JsonFileOverridesStore {
    path: PathBuf,
}

impl JsonFileOverridesStore {
    /// Store backed by `path`; the parent directory is created if needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn directory(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }
}

impl OverridesStore for JsonFileOverridesStore {
    fn load(&self) -> Result<PersistentState, PersistenceError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no overrides file, using defaults");
            return Ok(PersistentState::empty());
        }

        let payload = fs::read(&self.path).map_err(|source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        })?;
        if payload.iter().all(u8::is_ascii_whitespace) {
            warn!(path = %self.path.display(), "overrides file is empty, using defaults");
            return Ok(PersistentState::empty());
        }
        Ok(serde_json::from_slice(&payload)?)
    }

    fn save(&self, state: &PersistentState) -> Result<(), PersistenceError> {
        let payload = serde_json::to_vec_pretty(state)?;
        let dir = self.directory().to_path_buf();
        let io_err = |source| PersistenceError::Io {
            path: dir.clone(),
            source,
        };

        let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err)?;
        tmp.write_all(&payload).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| PersistenceError::Io {
            path: self.path.clone(),
            source: e.error,
        })?;

        debug!(path = %self.path.display(), entries = state.to_map().len(), "saved overrides");
        Ok(())
    }
}

/// Store selected by `config`: the JSON file named by `overrides_file`, or
/// an in-memory store when it is unset.
///
/// A file store is read once here so an unreadable or malformed file fails
/// at setup rather than on the first enable.
pub fn open_overrides_store(config: &FrameworkConfig) -> KernelResult<Arc<dyn OverridesStore>> {
    let Some(path) = &config.overrides_file else {
        return Ok(Arc::new(MemoryOverridesStore::new()));
    };

    let store = JsonFileOverridesStore::new(path)
        .map_err(|e| Report::new(KernelError::from(e)))
        .attach(format!("opening overrides file {}", path.display()))?;
    store
        .load()
        .map_err(|e| Report::new(KernelError::from(e)))
        .attach(format!("reading overrides file {}", path.display()))?;
    Ok(Arc::new(store))
}
