//! Streaming sources and sinks over concrete filesystems: on-disk
//! directory trees and tar archives.

use std::sync::Arc;

use lazy_static::lazy_static;

use casfs_castore::blobservice::MemoryProvider;
use casfs_castore::provider::Registry;

pub mod dir;
pub mod tar;

lazy_static! {
    /// The default provider registry: `dir` and `tar` sources/sinks,
    /// `memory` CAS.
    pub static ref REGISTRY: Registry = default_registry();
}

pub fn default_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register(Arc::new(dir::DirProvider));
    registry.register(Arc::new(tar::TarProvider));
    registry.register(Arc::new(MemoryProvider));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_expected_providers() {
        let registry = default_registry();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["dir", "memory", "tar"]);
    }

    #[test]
    fn capability_gaps_are_unsupported() {
        let registry = default_registry();
        let dir = registry.get("dir").unwrap();
        let dir_err = match dir.cas_builder() {
            Err(e) => e,
            Ok(_) => panic!("expected cas_builder to fail"),
        };
        assert!(matches!(dir_err, casfs_castore::Error::Unsupported(_)));
        let memory = registry.get("memory").unwrap();
        let memory_err = match memory.source_builder() {
            Err(e) => e,
            Ok(_) => panic!("expected source_builder to fail"),
        };
        assert!(matches!(memory_err, casfs_castore::Error::Unsupported(_)));
    }
}
