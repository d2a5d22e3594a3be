//! Module resolution
//!
//! A [`Resolver`] answers "where/what is this named unit". Resolvers chain:
//! a [`ModuleResolver`] looks in its own artifact first and only then asks
//! its delegate, typically the [`HostResolver`]. Local-first order lets a
//! module ship a newer copy of a shared library than the host without being
//! shadowed by it.

mod context;
mod entries;
mod host;
mod module;

pub use context::{current_resolver, scope_resolver, with_resolver};
pub use entries::{ArchiveEntryMap, NestedArchiveLayout};
pub use host::HostResolver;
pub use module::ModuleResolver;

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use zip::ZipArchive;

/// Where a named entry can be read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryLocation {
    /// Direct entry of the module artifact
    Archive { archive: PathBuf, entry: String },
    /// Entry of a nested archive extracted to scratch storage
    Nested {
        archive: PathBuf,
        entry: String,
        /// Name of the nested archive inside the module artifact
        bundled_as: String,
    },
    /// Unit registered by the host
    Host { name: String },
}

impl EntryLocation {
    /// Read the raw bytes behind an archive location.
    pub fn read(&self) -> Result<Vec<u8>, EntryReadError> {
        match self {
            EntryLocation::Archive { archive, entry } | EntryLocation::Nested { archive, entry, .. } => {
                read_zip_entry(archive, entry)
            }
            EntryLocation::Host { name } => Err(EntryReadError::HostOwned(name.clone())),
        }
    }

    /// Archive file backing this location, if any.
    pub fn archive(&self) -> Option<&Path> {
        match self {
            EntryLocation::Archive { archive, .. } | EntryLocation::Nested { archive, .. } => Some(archive),
            EntryLocation::Host { .. } => None,
        }
    }
}

const MAX_PREALLOCATION: u64 = 1 << 20;

/// Up-front buffer size for an entry; the declared size is untrusted.
fn preallocation(declared: u64) -> usize {
    declared.min(MAX_PREALLOCATION) as usize
}

fn read_zip_entry(archive: &Path, entry: &str) -> Result<Vec<u8>, EntryReadError> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(BufReader::new(file))?;
    let mut entry = zip.by_name(entry)?;
    let mut bytes = Vec::with_capacity(preallocation(entry.size()));
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Low-level failure reading an entry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EntryReadError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("host unit '{0}' is only readable through the host resolver")]
    HostOwned(String),
}

/// A materialized unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub name: String,
    pub bytes: Arc<[u8]>,
    pub location: EntryLocation,
}

impl Unit {
    pub fn new(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>, location: EntryLocation) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            location,
        }
    }
}

/// Resolver error types
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResolveError {
    /// Neither this resolver nor any delegate knows the name.
    #[error("Unit not found: {name}")]
    NotFound { name: String },

    /// The name was located but could not be materialized.
    #[error("Unit '{name}' is corrupt: {source}")]
    Corrupt {
        name: String,
        #[source]
        source: EntryReadError,
    },

    /// The resolver was closed and its scratch files released.
    #[error("Resolver for {artifact} is closed")]
    Closed { artifact: PathBuf },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ResolveError {
    pub fn not_found(name: &str) -> Self {
        ResolveError::NotFound {
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ResolveError::NotFound { .. })
    }
}

/// Strategy answering where/what a named unit is.
pub trait Resolver: Send + Sync {
    /// Materialize `name`, possibly from a cache.
    fn resolve(&self, name: &str) -> Result<Arc<Unit>, ResolveError>;

    /// Locate `name` without materializing or caching it.
    fn find_resource(&self, name: &str) -> Result<EntryLocation, ResolveError>;

    /// Read the bytes of `name` with the same precedence as
    /// [`Resolver::find_resource`], uncached.
    fn read_resource(&self, name: &str) -> Result<Vec<u8>, ResolveError>;

    /// Release everything the resolver owns. Idempotent.
    fn close(&self);
}
