//! The node model emitted by streaming sources.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Serialize, Serializer};

use crate::blobservice::BlobRead;
use crate::Error;

/// What a node is, derived from filesystem mode bits or a tar typeflag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Regular,
    Directory,
    Symlink,
    Other,
}

impl NodeKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Regular => "regular",
            NodeKind::Directory => "directory",
            NodeKind::Symlink => "symlink",
            NodeKind::Other => "other",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata carried by every node.
///
/// `user_id` and `group_id` preserve the source's decimal representation;
/// `mode` is the canonical `0o`-prefixed octal of the permission bits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeAttributes {
    pub mtime: DateTime<Utc>,
    pub user_id: String,
    pub group_id: String,
    pub user_name: String,
    pub group_name: String,
    pub mode: String,
    #[serde(
        skip_serializing_if = "BTreeMap::is_empty",
        serialize_with = "serialize_xattrs"
    )]
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

/// Xattr values are raw bytes in memory; JSON output renders them as
/// (lossy) UTF-8 strings.
fn serialize_xattrs<S>(xattrs: &BTreeMap<String, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_map(
        xattrs
            .iter()
            .map(|(name, value)| (name, String::from_utf8_lossy(value))),
    )
}

/// The flattened, serializable part of a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stat {
    pub name: String,
    pub kind: NodeKind,
    pub size: u64,
    /// Content digest for regular nodes, link target for symlinks,
    /// empty otherwise.
    pub payload: String,
    #[serde(flatten)]
    pub attributes: NodeAttributes,
}

/// Bound thunk producing a fresh byte stream of a regular node's contents.
pub type NodeOpener =
    Box<dyn Fn() -> BoxFuture<'static, Result<Box<dyn BlobRead>, Error>> + Send + Sync>;

/// One node produced by a source.
pub struct SourceNode {
    pub stat: Stat,
    /// Set for regular nodes only.
    pub opener: Option<NodeOpener>,
}

impl SourceNode {
    /// Opens a fresh byte stream of the node's contents.
    pub async fn open(&self) -> Result<Box<dyn BlobRead>, Error> {
        match &self.opener {
            Some(open) => open().await,
            None => Err(Error::NotFound(self.stat.name.clone())),
        }
    }
}

impl fmt::Debug for SourceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceNode")
            .field("stat", &self.stat)
            .finish_non_exhaustive()
    }
}
