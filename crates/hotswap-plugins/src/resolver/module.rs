use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace, warn};

use super::{ArchiveEntryMap, EntryLocation, NestedArchiveLayout, ResolveError, Resolver, Unit};

/// Child-first resolver over one module artifact.
///
/// Lookups go cache, then the artifact's own entry map, then the delegate.
/// Materialized units are cached for the resolver's lifetime; a reload
/// replaces the whole resolver rather than invalidating entries.
pub struct ModuleResolver {
    artifact: PathBuf,
    entries: HashMap<String, EntryLocation>,
    delegate: Option<Arc<dyn Resolver>>,
    cache: RwLock<HashMap<String, Arc<Unit>>>,
    scratch: Mutex<Vec<PathBuf>>,
    closed: AtomicBool,
}

impl ModuleResolver {
    pub fn new(map: ArchiveEntryMap, delegate: Option<Arc<dyn Resolver>>) -> Self {
        let (artifact, entries, scratch) = map.into_parts();
        Self {
            artifact,
            entries,
            delegate,
            cache: RwLock::new(HashMap::new()),
            scratch: Mutex::new(scratch),
            closed: AtomicBool::new(false),
        }
    }

    /// Build the entry map for `artifact` and wrap it.
    pub fn open(
        artifact: &Path,
        layout: &NestedArchiveLayout,
        delegate: Option<Arc<dyn Resolver>>,
    ) -> Result<Self, ResolveError> {
        let map = ArchiveEntryMap::build(artifact, layout)?;
        Ok(Self::new(map, delegate))
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    /// Whether the artifact itself (directly or nested) provides `name`.
    pub fn provides(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }

    fn ensure_open(&self) -> Result<(), ResolveError> {
        if self.is_closed() {
            return Err(ResolveError::Closed {
                artifact: self.artifact.clone(),
            });
        }
        Ok(())
    }

    fn load_local(&self, name: &str, location: &EntryLocation) -> Result<Arc<Unit>, ResolveError> {
        let bytes = location.read().map_err(|source| ResolveError::Corrupt {
            name: name.to_string(),
            source,
        })?;
        let unit = Arc::new(Unit::new(name, bytes, location.clone()));

        // Two racing loads of the same name: first writer wins, both callers
        // observe the same unit afterwards.
        let mut cache = self.cache.write();
        let unit = cache.entry(name.to_string()).or_insert(unit).clone();
        trace!(unit = name, artifact = %self.artifact.display(), "loaded local unit");
        Ok(unit)
    }

    fn delegate_or_not_found(&self, name: &str) -> Result<&Arc<dyn Resolver>, ResolveError> {
        self.delegate.as_ref().ok_or_else(|| ResolveError::not_found(name))
    }
}

impl Resolver for ModuleResolver {
    fn resolve(&self, name: &str) -> Result<Arc<Unit>, ResolveError> {
        self.ensure_open()?;

        if let Some(unit) = self.cache.read().get(name) {
            return Ok(Arc::clone(unit));
        }

        if let Some(location) = self.entries.get(name) {
            return self.load_local(name, location);
        }

        self.delegate_or_not_found(name)?.resolve(name)
    }

    fn find_resource(&self, name: &str) -> Result<EntryLocation, ResolveError> {
        self.ensure_open()?;
        match self.entries.get(name) {
            Some(location) => Ok(location.clone()),
            None => self.delegate_or_not_found(name)?.find_resource(name),
        }
    }

    fn read_resource(&self, name: &str) -> Result<Vec<u8>, ResolveError> {
        self.ensure_open()?;
        match self.entries.get(name) {
            Some(location) => location.read().map_err(|source| ResolveError::Corrupt {
                name: name.to_string(),
                source,
            }),
            None => self.delegate_or_not_found(name)?.read_resource(name),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let scratch = std::mem::take(&mut *self.scratch.lock());
        for path in &scratch {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove scratch file"),
            }
        }
        debug!(artifact = %self.artifact.display(), removed = scratch.len(), "closed module resolver");
    }
}

impl Drop for ModuleResolver {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ModuleResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleResolver")
            .field("artifact", &self.artifact)
            .field("entries", &self.entries.len())
            .field("has_delegate", &self.delegate.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}
