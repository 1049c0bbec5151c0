mod errors;
mod hashing;
mod index;
mod nodes;
mod source;

pub mod blobservice;
pub mod provider;
pub mod record;
pub mod sri;

pub use errors::Error;
pub use hashing::HashingReader;
pub use index::{DigestIndex, Location};
pub use nodes::{NodeAttributes, NodeKind, NodeOpener, SourceNode, Stat};
pub use source::{CasReader, Sink, Source, Tree};
pub use sri::{Algorithm, SriDigest};
