//! Describing deployment units as modules.

use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

use hotswap_kernel::module::KeyError;
use hotswap_kernel::{ModuleDescriptor, ModuleId, ModuleKey};

use crate::deployment::DeploymentUnit;
use crate::resolver::Resolver;

/// Version given to artifacts whose name carries none.
pub const UNVERSIONED: &str = "0.0.0";

/// Descriptor error types
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DescriptorError {
    #[error("Cannot derive a module key from {artifact}: {source}")]
    InvalidKey {
        artifact: PathBuf,
        #[source]
        source: KeyError,
    },

    #[error("Invalid descriptor in {artifact}: {reason}")]
    Invalid { artifact: PathBuf, reason: String },
}

/// Supplies the [`ModuleDescriptor`] for a freshly opened artifact.
pub trait DescriptorProvider: Send + Sync {
    fn describe(&self, unit: &DeploymentUnit, resolver: &dyn Resolver) -> Result<ModuleDescriptor, DescriptorError>;
}

/// Derives key and version from the artifact file name, `audit-log-1.2.3.zip`
/// giving key `audit-log` and version `1.2.3`.
#[derive(Debug, Clone, Default)]
pub struct ArtifactNameDescriptors {
    disabled_by_default: HashSet<ModuleKey>,
    non_disableable: HashSet<ModuleKey>,
}

impl ArtifactNameDescriptors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disabled_by_default(mut self, key: ModuleKey) -> Self {
        self.disabled_by_default.insert(key);
        self
    }

    pub fn non_disableable(mut self, key: ModuleKey) -> Self {
        self.non_disableable.insert(key);
        self
    }
}

impl DescriptorProvider for ArtifactNameDescriptors {
    fn describe(&self, unit: &DeploymentUnit, _resolver: &dyn Resolver) -> Result<ModuleDescriptor, DescriptorError> {
        let stem = unit
            .path()
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| DescriptorError::Invalid {
                artifact: unit.path().to_path_buf(),
                reason: "file name is not valid UTF-8".to_string(),
            })?;

        let (key, version) = split_stem(stem);
        let key = ModuleKey::new(key).map_err(|source| DescriptorError::InvalidKey {
            artifact: unit.path().to_path_buf(),
            source,
        })?;

        Ok(ModuleDescriptor::new(ModuleId::new(key.clone(), version))
            .with_enabled_by_default(!self.disabled_by_default.contains(&key))
            .with_disableable(!self.non_disableable.contains(&key)))
    }
}

/// Split `name-1.2.3` at the last `-` followed by a digit.
fn split_stem(stem: &str) -> (&str, &str) {
    stem.rmatch_indices('-')
        .map(|(i, _)| i)
        .find(|&i| stem[i + 1..].starts_with(|c: char| c.is_ascii_digit()) && i > 0)
        .map_or((stem, UNVERSIONED), |i| (&stem[..i], &stem[i + 1..]))
}
