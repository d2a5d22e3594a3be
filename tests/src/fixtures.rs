use hotswap_kernel::FrameworkConfig;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Default prefix under which nested archives are bundled.
pub const NESTED_PREFIX: &str = "bundled-libs/";

/// Builds module artifacts in memory.
#[derive(Debug, Clone, Default)]
pub struct ArchiveBuilder {
    entries: Vec<(String, Vec<u8>)>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, name: impl Into<String>, bytes: impl AsRef<[u8]>) -> Self {
        self.entries.push((name.into(), bytes.as_ref().to_vec()));
        self
    }

    /// Bundle `archive` as `bundled-libs/<file_name>`.
    pub fn nested(self, file_name: &str, archive: ArchiveBuilder) -> Self {
        let bytes = archive.build();
        self.entry(format!("{NESTED_PREFIX}{file_name}"), bytes)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, bytes) in &self.entries {
            writer
                .start_file(name.as_str(), SimpleFileOptions::default())
                .expect("start zip entry");
            writer.write_all(bytes).expect("write zip entry");
        }
        writer.finish().expect("finish zip").into_inner()
    }

    pub fn write_to(&self, path: &Path) {
        fs::write(path, self.build()).expect("write archive");
    }
}

/// A throwaway plugin directory with its scratch space.
pub struct PluginDir {
    temp: TempDir,
}

impl PluginDir {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("create temp dir");
        fs::create_dir_all(temp.path().join("plugins")).expect("create plugin dir");
        Self { temp }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn plugins(&self) -> PathBuf {
        self.temp.path().join("plugins")
    }

    pub fn scratch(&self) -> PathBuf {
        self.temp.path().join("scratch")
    }

    /// Configuration pointing at this directory.
    pub fn config(&self) -> FrameworkConfig {
        FrameworkConfig::new(self.plugins()).with_scratch_dir(self.scratch())
    }

    /// Write `archive` into the plugin directory as `file_name`.
    pub fn deploy(&self, file_name: &str, archive: &ArchiveBuilder) -> PathBuf {
        let path = self.plugins().join(file_name);
        archive.write_to(&path);
        path
    }

    /// Push the modification time of `path` forward so scanners see a change.
    pub fn bump_mtime(&self, path: &Path) {
        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .expect("read mtime");
        fs::File::options()
            .write(true)
            .open(path)
            .and_then(|f| f.set_modified(modified + Duration::from_secs(2)))
            .expect("set mtime");
    }

    /// Sorted file names in the plugin directory, hidden ones included.
    pub fn listing(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.plugins())
            .expect("read plugin dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Files currently in the scratch directory.
    pub fn scratch_files(&self) -> usize {
        fs::read_dir(self.scratch()).map(|d| d.count()).unwrap_or(0)
    }
}

impl Default for PluginDir {
    fn default() -> Self {
        Self::new()
    }
}
