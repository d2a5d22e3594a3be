//! Backup/revert installation into a flat plugin directory.
//!
//! The first install of a key in an installer's lifetime preserves whatever
//! live artifact it replaces under `backup_prefix + file name`. Later installs
//! of the same key reuse that record, so a revert always goes back to the
//! state before the first install, never merely the previous one.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use hotswap_kernel::{FrameworkConfig, ModuleKey};

/// Installer error types
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InstallError {
    /// A backup already sits where the first install of `key` wants to put
    /// one. Usually an earlier revert never completed; resolve by hand.
    #[error("Backup {backup} for '{key}' already exists")]
    BackupConflict { key: ModuleKey, backup: PathBuf },

    #[error("Invalid artifact file name '{0}'")]
    InvalidName(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> InstallError + '_ {
    move |source| InstallError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// An artifact that can be copied into the plugin directory.
pub trait PluginArtifact: Send + Sync {
    /// File name the artifact is installed under.
    fn name(&self) -> &str;

    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>>;
}

/// Artifact backed by a file elsewhere on disk.
#[derive(Debug, Clone)]
pub struct FileArtifact {
    path: PathBuf,
    name: String,
}

impl FileArtifact {
    /// Installs under the source file's own name.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { path, name }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl PluginArtifact for FileArtifact {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(File::open(&self.path)?))
    }
}

/// Artifact held in memory, e.g. an upload.
#[derive(Debug, Clone)]
pub struct BytesArtifact {
    name: String,
    bytes: Arc<[u8]>,
}

impl BytesArtifact {
    pub fn new(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

impl PluginArtifact for BytesArtifact {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(Cursor::new(&self.bytes[..])))
    }
}

/// What the first install of a key replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    /// The preserved copy for an upgrade, the installed path itself for a
    /// fresh install
    pub backup_location: PathBuf,
    /// File name of the artifact live before the first install
    pub original_name: String,
    /// File name of the most recent install
    pub installed_name: String,
    pub is_upgrade: bool,
}

/// Installer over one flat directory of live artifacts.
#[derive(Debug)]
pub struct DirectoryInstaller {
    directory: PathBuf,
    backup_prefix: String,
    records: RwLock<Arc<HashMap<ModuleKey, BackupRecord>>>,
}

impl DirectoryInstaller {
    pub fn new(directory: impl Into<PathBuf>, backup_prefix: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            backup_prefix: backup_prefix.into(),
            records: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &FrameworkConfig) -> Self {
        Self::new(config.plugin_dir.clone(), config.backup_prefix.clone())
    }

    pub fn plugin_directory(&self) -> &Path {
        &self.directory
    }

    pub fn backup_record(&self, key: &ModuleKey) -> Option<BackupRecord> {
        self.records.read().get(key).cloned()
    }

    pub fn has_backup(&self, key: &ModuleKey) -> bool {
        self.records.read().contains_key(key)
    }

    /// Snapshot of all records; never observes a half-applied update.
    pub fn backup_records(&self) -> Arc<HashMap<ModuleKey, BackupRecord>> {
        Arc::clone(&self.records.read())
    }

    fn update_records(&self, f: impl FnOnce(&mut HashMap<ModuleKey, BackupRecord>)) {
        let mut guard = self.records.write();
        let mut next = HashMap::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }

    fn validate_name<'a>(&self, name: &'a str) -> Result<&'a str, InstallError> {
        let invalid = name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\'])
            || name.starts_with(&self.backup_prefix);
        if invalid {
            return Err(InstallError::InvalidName(name.to_string()));
        }
        Ok(name)
    }

    /// Install `artifact` for `key`, returning the live path.
    pub fn install_plugin(&self, key: &ModuleKey, artifact: &dyn PluginArtifact) -> Result<PathBuf, InstallError> {
        let name = self.validate_name(artifact.name())?;
        let target = self.directory.join(name);
        fs::create_dir_all(&self.directory).map_err(io_err(&self.directory))?;

        let record = match self.backup_record(key) {
            None => self.first_install_record(key, name, &target)?,
            Some(mut record) => {
                if record.installed_name != name {
                    let previous = self.directory.join(&record.installed_name);
                    remove_if_present(&previous)?;
                    debug!(%key, previous = %previous.display(), "removed previous install with a different name");
                    record.installed_name = name.to_string();
                }
                record
            }
        };

        // Recorded before the copy so a failed write can still be reverted.
        self.update_records(|records| {
            records.insert(key.clone(), record);
        });

        write_atomically(artifact, &self.directory, &target)?;
        info!(%key, path = %target.display(), "installed plugin artifact");
        Ok(target)
    }

    fn first_install_record(&self, key: &ModuleKey, name: &str, target: &Path) -> Result<BackupRecord, InstallError> {
        let backup = self.directory.join(format!("{}{}", self.backup_prefix, name));
        if backup.exists() {
            return Err(InstallError::BackupConflict {
                key: key.clone(),
                backup,
            });
        }

        if target.is_file() {
            fs::copy(target, &backup).map_err(io_err(&backup))?;
            info!(%key, backup = %backup.display(), "backed up live artifact");
            Ok(BackupRecord {
                backup_location: backup,
                original_name: name.to_string(),
                installed_name: name.to_string(),
                is_upgrade: true,
            })
        } else {
            Ok(BackupRecord {
                backup_location: target.to_path_buf(),
                original_name: name.to_string(),
                installed_name: name.to_string(),
                is_upgrade: false,
            })
        }
    }

    /// Undo every install of `key` since the first one. Returns `false` when
    /// nothing was recorded for the key.
    pub fn revert_installed_plugin(&self, key: &ModuleKey) -> Result<bool, InstallError> {
        let Some(record) = self.backup_record(key) else {
            debug!(%key, "nothing to revert");
            return Ok(false);
        };

        remove_if_present(&self.directory.join(&record.installed_name))?;

        if record.is_upgrade {
            let original = self.directory.join(&record.original_name);
            fs::rename(&record.backup_location, &original).map_err(io_err(&record.backup_location))?;
            info!(%key, restored = %original.display(), "restored backed up artifact");
        } else {
            info!(%key, "reverted fresh install");
        }

        self.update_records(|records| {
            records.remove(key);
        });
        Ok(true)
    }

    /// Delete all upgrade backups and forget every record.
    ///
    /// Records whose backup could not be deleted are kept; the first such
    /// failure is returned.
    pub fn clear_backups(&self) -> Result<(), InstallError> {
        let (cleared, first_error) = self.delete_backups(&self.backup_records());
        info!(cleared = cleared.len(), "cleared backups");
        self.forget_records(&cleared);
        first_error.map_or(Ok(()), Err)
    }

    /// Delete the upgrade backups of `records`, returning the records that
    /// no longer guard anything on disk.
    fn delete_backups(
        &self,
        records: &HashMap<ModuleKey, BackupRecord>,
    ) -> (HashMap<ModuleKey, BackupRecord>, Option<InstallError>) {
        let mut first_error = None;
        let mut cleared = HashMap::new();

        for (key, record) in records.iter() {
            if record.is_upgrade
                && let Err(e) = remove_if_present(&record.backup_location)
            {
                warn!(%key, error = %e, "failed to delete backup");
                first_error.get_or_insert(e);
                continue;
            }
            cleared.insert(key.clone(), record.clone());
        }
        (cleared, first_error)
    }

    /// Drop exactly the `cleared` records. Records created or replaced since
    /// the snapshot was taken stay.
    fn forget_records(&self, cleared: &HashMap<ModuleKey, BackupRecord>) {
        self.update_records(|records| records.retain(|key, record| cleared.get(key) != Some(record)));
    }
}

fn remove_if_present(path: &Path) -> Result<(), InstallError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(InstallError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write to a temp file in `dir`, then rename over `target`.
fn write_atomically(artifact: &dyn PluginArtifact, dir: &Path, target: &Path) -> Result<(), InstallError> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    let mut reader = artifact.open().map_err(io_err(target))?;
    io::copy(&mut reader, &mut tmp).map_err(io_err(tmp.path()))?;
    tmp.as_file().sync_all().map_err(io_err(target))?;
    tmp.persist(target).map_err(|e| InstallError::Io {
        path: target.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}
