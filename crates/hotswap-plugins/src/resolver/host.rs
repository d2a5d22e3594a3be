use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{EntryLocation, ResolveError, Resolver, Unit};

/// Units provided by the host process, registered at startup.
///
/// Sits at the root of every resolver chain.
#[derive(Debug, Default)]
pub struct HostResolver {
    units: RwLock<HashMap<String, Arc<Unit>>>,
}

impl HostResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a host unit.
    pub fn register(&self, name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        let name = name.into();
        let unit = Arc::new(Unit::new(
            name.clone(),
            bytes,
            EntryLocation::Host { name: name.clone() },
        ));
        debug!(unit = %name, "registered host unit");
        self.units.write().insert(name, unit);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.read().is_empty()
    }

    fn lookup(&self, name: &str) -> Result<Arc<Unit>, ResolveError> {
        self.units
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ResolveError::not_found(name))
    }
}

impl Resolver for HostResolver {
    fn resolve(&self, name: &str) -> Result<Arc<Unit>, ResolveError> {
        self.lookup(name)
    }

    fn find_resource(&self, name: &str) -> Result<EntryLocation, ResolveError> {
        self.lookup(name).map(|unit| unit.location.clone())
    }

    fn read_resource(&self, name: &str) -> Result<Vec<u8>, ResolveError> {
        self.lookup(name).map(|unit| unit.bytes.to_vec())
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let host = HostResolver::new();
        assert!(host.is_empty());
        host.register("logging", b"host-logging".to_vec());

        let unit = host.resolve("logging").unwrap();
        assert_eq!(&*unit.bytes, b"host-logging");
        assert_eq!(
            host.find_resource("logging").unwrap(),
            EntryLocation::Host {
                name: "logging".to_string()
            }
        );
        assert_eq!(host.read_resource("logging").unwrap(), b"host-logging");
        assert!(host.resolve("json").unwrap_err().is_not_found());
    }

    #[test]
    fn test_register_replaces() {
        let host = HostResolver::new();
        host.register("a", b"one".to_vec());
        host.register("a", b"two".to_vec());
        assert_eq!(host.len(), 1);
        assert_eq!(&*host.resolve("a").unwrap().bytes, b"two");

        // close is a no-op for the host
        host.close();
        assert!(host.contains("a"));
    }
}
