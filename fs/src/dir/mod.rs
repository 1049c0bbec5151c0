//! Source for on-disk directory trees.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use walkdir::WalkDir;

use casfs_castore::blobservice::BlobRead;
use casfs_castore::{
    sri, Algorithm, CasReader, DigestIndex, Error, Location, NodeKind, Source, SourceNode, SriDigest,
    Stat,
};

mod attrs;
mod builder;

pub use builder::{DirProvider, DirSourceBuilder};

/// Streams a directory tree in pre-order, lexically sorted per level.
///
/// The traversal runs on a background worker producing onto a one-item
/// rendezvous channel; digests of visited regular files are recorded in
/// a [`DigestIndex`] so [`CasReader::open`] can serve them without a
/// rescan.
pub struct DirSource {
    index: Arc<DigestIndex>,
    nodes: mpsc::Receiver<Result<SourceNode, Error>>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

#[derive(Clone)]
struct WalkConfig {
    dir: String,
    algo: Algorithm,
    keep_prefix: bool,
    preserve_xattrs: bool,
    index: Arc<DigestIndex>,
}

impl DirSource {
    fn spawn(config: WalkConfig) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let index = config.index.clone();
        let worker = tokio::spawn(walk(config, tx, cancel.clone()));
        Self {
            index,
            nodes: rx,
            cancel,
            worker: Some(worker),
        }
    }
}

#[async_trait]
impl CasReader for DirSource {
    async fn open(&self, digest: &SriDigest) -> Result<Box<dyn BlobRead>, Error> {
        match self.index.get(digest) {
            Some(Location::Path(path)) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Box::new(file))
            }
            _ => Err(Error::NotFound(digest.to_string())),
        }
    }
}

#[async_trait]
impl Source for DirSource {
    async fn next(&mut self) -> Option<Result<SourceNode, Error>> {
        self.nodes.recv().await
    }

    #[instrument(skip(self))]
    async fn close_wait(&mut self) -> Result<(), Error> {
        self.cancel.cancel();
        self.nodes.close();
        if let Some(worker) = self.worker.take() {
            worker.await?;
        }
        while self.nodes.try_recv().is_ok() {}
        Ok(())
    }
}

async fn walk(
    config: WalkConfig,
    tx: mpsc::Sender<Result<SourceNode, Error>>,
    cancel: CancellationToken,
) {
    let walker = WalkDir::new(&config.dir)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let item = match entry {
            Ok(entry) => prepare_node(&config, entry.path()).await,
            Err(e) => Err(Error::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop detected")
            }))),
        };
        let failed = item.is_err();

        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = tx.send(item) => {
                if sent.is_err() {
                    return;
                }
            }
        }

        // one error record, then end of stream.
        if failed {
            return;
        }
    }
}

async fn prepare_node(config: &WalkConfig, path: &Path) -> Result<SourceNode, Error> {
    let metadata = std::fs::symlink_metadata(path)?;
    let kind = kind_from_file_type(&metadata.file_type());

    let (payload, size, opener) = match kind {
        NodeKind::Regular => {
            let file = tokio::fs::File::open(path).await?;
            let digest = sri::hash_reader(config.algo, file).await?;
            config
                .index
                .set(digest.clone(), Location::Path(path.to_path_buf()));
            (
                digest.to_string(),
                metadata.len(),
                Some(file_opener(path.to_path_buf())),
            )
        }
        NodeKind::Symlink => {
            let target = std::fs::read_link(path)?;
            let target = target.to_string_lossy().into_owned();
            (
                normalize_symlink_target(&target, &config.dir, config.keep_prefix),
                0,
                None,
            )
        }
        _ => (String::new(), 0, None),
    };

    let attributes = attrs::node_attributes(path, &metadata, config.preserve_xattrs)?;

    Ok(SourceNode {
        stat: Stat {
            name: normalize_path(path, &config.dir, config.keep_prefix),
            kind,
            size,
            payload,
            attributes,
        },
        opener,
    })
}

fn file_opener(path: PathBuf) -> casfs_castore::NodeOpener {
    Box::new(move || {
        let path = path.clone();
        Box::pin(async move {
            let file = tokio::fs::File::open(&path).await?;
            Ok(Box::new(file) as Box<dyn BlobRead>)
        })
    })
}

fn kind_from_file_type(file_type: &std::fs::FileType) -> NodeKind {
    if file_type.is_dir() {
        NodeKind::Directory
    } else if file_type.is_symlink() {
        NodeKind::Symlink
    } else if file_type.is_file() {
        NodeKind::Regular
    } else {
        NodeKind::Other
    }
}

fn normalize_path(path: &Path, dir: &str, keep_prefix: bool) -> String {
    let path = path.to_string_lossy();
    let mut name: &str = &path;
    if !keep_prefix {
        if let Some(stripped) = name.strip_prefix(dir) {
            name = stripped;
        }
    }
    if name.is_empty() {
        return "/".to_string();
    }
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

/// Relative targets are preserved verbatim; absolute targets lose the
/// configured dir prefix unless `keep_prefix` is set.
fn normalize_symlink_target(target: &str, dir: &str, keep_prefix: bool) -> String {
    if !target.starts_with('/') {
        return target.to_string();
    }
    let mut prefix = dir.to_string();
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    if !keep_prefix {
        if let Some(stripped) = target.strip_prefix(&prefix) {
            return stripped.to_string();
        }
    }
    target.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_path_strips_prefix() {
        assert_eq!(
            normalize_path(Path::new("/tmp/x/a.txt"), "/tmp/x", false),
            "/a.txt"
        );
    }

    #[test]
    fn normalize_path_root_is_slash() {
        assert_eq!(normalize_path(Path::new("/tmp/x"), "/tmp/x", false), "/");
    }

    #[test]
    fn normalize_path_keep_prefix() {
        assert_eq!(
            normalize_path(Path::new("/tmp/x/a.txt"), "/tmp/x", true),
            "/tmp/x/a.txt"
        );
    }

    #[test]
    fn normalize_path_relative_dir_gets_leading_slash() {
        assert_eq!(
            normalize_path(Path::new("subdir/a.txt"), "subdir", false),
            "/a.txt"
        );
        assert_eq!(
            normalize_path(Path::new("subdir/a.txt"), "subdir", true),
            "/subdir/a.txt"
        );
    }

    #[test]
    fn symlink_target_relative_verbatim() {
        assert_eq!(
            normalize_symlink_target("../a.txt", "/tmp/x", false),
            "../a.txt"
        );
    }

    #[test]
    fn symlink_target_absolute_stripped() {
        assert_eq!(
            normalize_symlink_target("/tmp/x/a.txt", "/tmp/x", false),
            "a.txt"
        );
    }

    #[test]
    fn symlink_target_absolute_kept_with_keep_prefix() {
        assert_eq!(
            normalize_symlink_target("/tmp/x/a.txt", "/tmp/x", true),
            "/tmp/x/a.txt"
        );
    }

    #[test]
    fn symlink_target_outside_prefix_untouched() {
        assert_eq!(
            normalize_symlink_target("/etc/passwd", "/tmp/x", false),
            "/etc/passwd"
        );
    }
}
