//! The contracts between tree producers, consumers and their stores.

use async_trait::async_trait;

use crate::blobservice::BlobRead;
use crate::nodes::{SourceNode, Stat};
use crate::sri::SriDigest;
use crate::Error;

/// Random access into content a source has already visited.
#[async_trait]
pub trait CasReader: Send + Sync {
    /// Opens a fresh byte stream for the given digest.
    /// Fails with [`Error::NotFound`] if the digest was never indexed.
    async fn open(&self, digest: &SriDigest) -> Result<Box<dyn BlobRead>, Error>;
}

/// A streaming producer of [`SourceNode`]s for a single input.
///
/// Iteration is one-shot: once `next` returns `None`, the source is
/// exhausted. [`Source::close_wait`] signals cancellation to the
/// traversal worker and joins it; it is idempotent.
#[async_trait]
pub trait Source: CasReader {
    /// Returns the next node in pre-order, an error record, or `None`
    /// at end of stream.
    async fn next(&mut self) -> Option<Result<SourceNode, Error>>;

    /// Stops the background traversal and releases held resources.
    async fn close_wait(&mut self) -> Result<(), Error>;
}

/// A consumer of a traversed tree, writing it to some output format.
#[async_trait]
pub trait Sink: Send {
    /// Visits the tree in order and materializes it. The `cas` serves
    /// regular-node contents by payload digest.
    async fn consume(&mut self, tree: &Tree, cas: &dyn CasReader) -> Result<(), Error>;
}

/// The accumulated node sequence of one source, in traversal order.
#[derive(Debug, Default)]
pub struct Tree {
    pub nodes: Vec<SourceNode>,
}

impl Tree {
    /// Drains a source into a tree, failing on the first error record.
    pub async fn from_source<S>(source: &mut S) -> Result<Self, Error>
    where
        S: Source + ?Sized,
    {
        let mut nodes = Vec::new();
        while let Some(node) = source.next().await {
            nodes.push(node?);
        }
        Ok(Tree { nodes })
    }

    /// The flattened per-node records, e.g. for JSON output.
    pub fn stats(&self) -> impl Iterator<Item = &Stat> {
        self.nodes.iter().map(|node| &node.stat)
    }
}
