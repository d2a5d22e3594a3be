//! Deployment units: an artifact path plus the time it was deployed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Identity + timestamp of an artifact, used only for change detection.
///
/// Ordered by path, then by timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeploymentUnit {
    path: PathBuf,
    deployed_at: SystemTime,
}

impl DeploymentUnit {
    pub fn new(path: impl Into<PathBuf>, deployed_at: SystemTime) -> Self {
        Self {
            path: path.into(),
            deployed_at,
        }
    }

    /// Unit for an artifact on disk, stamped with its modification time.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let modified = fs::metadata(path)?.modified()?;
        Ok(Self::new(path, modified))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn deployed_at(&self) -> SystemTime {
        self.deployed_at
    }

    /// File name of the artifact, lossily converted.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
