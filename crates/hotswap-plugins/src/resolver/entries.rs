//! Flattening an artifact and its nested archives into one namespace.
//!
//! Precedence is fixed: direct entries of the artifact always win, then the
//! first nested archive (in the artifact's enumeration order) that carries a
//! name, then later ones.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zip::ZipArchive;

use hotswap_kernel::FrameworkConfig;

use super::{EntryLocation, EntryReadError, ResolveError};

/// Where nested archives live inside an artifact and where they get extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedArchiveLayout {
    /// Entry-name prefix, e.g. `bundled-libs/`
    pub prefix: String,
    /// Extension without the dot, e.g. `zip`
    pub extension: String,
    /// Directory receiving the extracted scratch copies
    pub scratch_dir: PathBuf,
}

impl NestedArchiveLayout {
    pub fn new(prefix: impl Into<String>, extension: impl Into<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            extension: extension.into().trim_start_matches('.').to_string(),
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn from_config(config: &FrameworkConfig) -> Self {
        Self::new(
            config.nested_prefix.clone(),
            config.nested_extension.clone(),
            config.scratch_dir(),
        )
    }

    /// Whether a direct entry name denotes a nested archive.
    pub fn is_nested(&self, entry: &str) -> bool {
        entry.len() > self.prefix.len()
            && entry.starts_with(&self.prefix)
            && Path::new(entry)
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.extension))
    }
}

/// Name → location map for one artifact, plus the scratch files it extracted.
#[derive(Debug, Default)]
pub struct ArchiveEntryMap {
    artifact: PathBuf,
    entries: HashMap<String, EntryLocation>,
    scratch_files: Vec<PathBuf>,
}

impl ArchiveEntryMap {
    /// Build the map for `artifact`, extracting its nested archives.
    ///
    /// On failure every scratch file created so far is deleted.
    pub fn build(artifact: &Path, layout: &NestedArchiveLayout) -> Result<Self, ResolveError> {
        let mut map = ArchiveEntryMap {
            artifact: artifact.to_path_buf(),
            ..Default::default()
        };

        if let Err(e) = map.populate(layout) {
            map.remove_scratch_files();
            return Err(e);
        }

        debug!(
            artifact = %artifact.display(),
            entries = map.entries.len(),
            nested = map.scratch_files.len(),
            "built archive entry map"
        );
        Ok(map)
    }

    fn populate(&mut self, layout: &NestedArchiveLayout) -> Result<(), ResolveError> {
        let artifact_name = self.artifact.display().to_string();
        let file = File::open(&self.artifact).map_err(|source| ResolveError::Io {
            path: self.artifact.clone(),
            source,
        })?;
        let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| corrupt(&artifact_name, e))?;

        let mut nested = Vec::new();
        for index in 0..archive.len() {
            let entry = archive.by_index(index).map_err(|e| corrupt(&artifact_name, e))?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            if layout.is_nested(&name) {
                nested.push(name.clone());
            }
            // Direct entries are authoritative.
            self.entries.insert(
                name.clone(),
                EntryLocation::Archive {
                    archive: self.artifact.clone(),
                    entry: name,
                },
            );
        }

        if nested.is_empty() {
            return Ok(());
        }

        fs::create_dir_all(&layout.scratch_dir).map_err(|source| ResolveError::Io {
            path: layout.scratch_dir.clone(),
            source,
        })?;

        for bundled_as in nested {
            let scratch = self.extract_nested(&mut archive, &bundled_as, layout)?;
            self.merge_nested(&scratch, &bundled_as)?;
        }
        Ok(())
    }

    fn extract_nested<R: io::Read + io::Seek>(
        &mut self,
        archive: &mut ZipArchive<R>,
        bundled_as: &str,
        layout: &NestedArchiveLayout,
    ) -> Result<PathBuf, ResolveError> {
        let suffix = format!(".{}", layout.extension);
        let (mut out, path) = tempfile::Builder::new()
            .prefix("hotswap-nested-")
            .suffix(&suffix)
            .tempfile_in(&layout.scratch_dir)
            .and_then(|tmp| tmp.keep().map_err(|e| e.error))
            .map_err(|source| ResolveError::Io {
                path: layout.scratch_dir.clone(),
                source,
            })?;
        self.scratch_files.push(path.clone());

        let mut entry = archive.by_name(bundled_as).map_err(|e| corrupt(bundled_as, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| corrupt(bundled_as, e))?;

        debug!(nested = bundled_as, scratch = %path.display(), "extracted nested archive");
        Ok(path)
    }

    fn merge_nested(&mut self, scratch: &Path, bundled_as: &str) -> Result<(), ResolveError> {
        let file = File::open(scratch).map_err(|e| corrupt(bundled_as, e))?;
        let mut nested = ZipArchive::new(BufReader::new(file)).map_err(|e| corrupt(bundled_as, e))?;

        for index in 0..nested.len() {
            let entry = nested.by_index(index).map_err(|e| corrupt(bundled_as, e))?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            // Only fills gaps: direct entries and earlier nested archives win.
            self.entries.entry(name.clone()).or_insert_with(|| EntryLocation::Nested {
                archive: scratch.to_path_buf(),
                entry: name,
                bundled_as: bundled_as.to_string(),
            });
        }
        Ok(())
    }

    fn remove_scratch_files(&mut self) {
        for path in self.scratch_files.drain(..) {
            if let Err(e) = fs::remove_file(&path)
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %e, "failed to remove scratch file");
            }
        }
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn get(&self, name: &str) -> Option<&EntryLocation> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn scratch_files(&self) -> &[PathBuf] {
        &self.scratch_files
    }

    /// Split into the entry table and the owned scratch files.
    pub(crate) fn into_parts(mut self) -> (PathBuf, HashMap<String, EntryLocation>, Vec<PathBuf>) {
        let entries = std::mem::take(&mut self.entries);
        let scratch = std::mem::take(&mut self.scratch_files);
        (std::mem::take(&mut self.artifact), entries, scratch)
    }
}

fn corrupt(name: &str, source: impl Into<EntryReadError>) -> ResolveError {
    ResolveError::Corrupt {
        name: name.to_string(),
        source: source.into(),
    }
}
