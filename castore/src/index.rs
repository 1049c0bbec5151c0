use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::sri::SriDigest;

/// Physical location of a digest's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// A file on the local filesystem.
    Path(PathBuf),
    /// A byte range of a random-access input.
    Section { offset: u64, length: u64 },
}

/// Concurrent digest-to-location mapping with write-once semantics.
#[derive(Default)]
pub struct DigestIndex {
    inner: RwLock<HashMap<SriDigest, Location>>,
}

impl DigestIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, digest: &SriDigest) -> Option<Location> {
        self.inner.read().unwrap().get(digest).cloned()
    }

    /// Records the location for a digest. If the digest is already
    /// present, the existing location is kept.
    pub fn set(&self, digest: SriDigest, location: Location) {
        self.inner
            .write()
            .unwrap()
            .entry(digest)
            .or_insert(location);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
