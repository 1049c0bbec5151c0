use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tar::{Archive, Entry, EntryType};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use casfs_castore::blobservice::BlobRead;
use casfs_castore::{
    Algorithm, CasReader, Error, NodeAttributes, NodeKind, NodeOpener, Source, SourceNode,
    SriDigest, Stat,
};

use super::section::TarCas;

pub type ArchiveReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Clone)]
pub(super) struct TarWalkConfig {
    pub algo: Algorithm,
    /// PAX record prefixes identifying xattrs. Later prefixes override
    /// earlier ones when the same attribute appears under several.
    pub xattr_pax_prefixes: Vec<String>,
    pub trim_nul_xattrs: bool,
}

/// Streams a tar archive sequentially, memoizing regular entry bodies
/// through the associated [`TarCas`] for later random access.
pub struct TarSource {
    cas: Arc<TarCas>,
    nodes: mpsc::Receiver<Result<SourceNode, Error>>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl TarSource {
    pub(super) fn spawn(reader: ArchiveReader, cas: Arc<TarCas>, config: TarWalkConfig) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(walk(
            Archive::new(reader),
            cas.clone(),
            config,
            tx,
            cancel.clone(),
        ));
        Self {
            cas,
            nodes: rx,
            cancel,
            worker: Some(worker),
        }
    }
}

#[async_trait]
impl CasReader for TarSource {
    async fn open(&self, digest: &SriDigest) -> Result<Box<dyn BlobRead>, Error> {
        self.cas.open(digest).await
    }
}

#[async_trait]
impl Source for TarSource {
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
    mut archive: Archive<ArchiveReader>,
    cas: Arc<TarCas>,
    config: TarWalkConfig,
    tx: mpsc::Sender<Result<SourceNode, Error>>,
    cancel: CancellationToken,
) {
    let mut entries = match archive.entries() {
        Ok(entries) => entries,
        Err(e) => {
            let _ = tx.send(Err(Error::Io(e))).await;
            return;
        }
    };

    loop {
        let entry = tokio::select! {
            _ = cancel.cancelled() => return,
            entry = entries.next() => entry,
        };
        let Some(entry) = entry else { return };

        let item = match entry {
            Ok(entry) => match prepare_node(entry, &cas, &config).await {
                Ok(Some(node)) => Ok(node),
                // entries carrying no node of their own (pax headers).
                Ok(None) => continue,
                Err(e) => Err(e),
            },
            Err(e) => Err(Error::Io(e)),
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

        if failed {
            return;
        }
    }
}

async fn prepare_node(
    mut entry: Entry<Archive<ArchiveReader>>,
    cas: &Arc<TarCas>,
    config: &TarWalkConfig,
) -> Result<Option<SourceNode>, Error> {
    let Some(kind) = kind_from_entry_type(entry.header().entry_type()) else {
        return Ok(None);
    };

    let name = normalize_name(&entry.path_bytes());
    let declared_size = entry.header().size()?;
    let mode = entry.header().mode()?;
    let uid = entry.header().uid()?;
    let gid = entry.header().gid()?;
    let mtime = entry.header().mtime()?;
    let user_name = entry
        .header()
        .username()
        .ok()
        .flatten()
        .unwrap_or_default()
        .to_string();
    let group_name = entry
        .header()
        .groupname()
        .ok()
        .flatten()
        .unwrap_or_default()
        .to_string();
    let link_name = entry
        .link_name_bytes()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

    let xattrs = extract_xattrs(&mut entry, config).await?;

    let (payload, size, opener) = match kind {
        NodeKind::Regular => {
            let digest = cas.record(&mut entry, declared_size, config.algo).await?;
            let opener = cas_opener(cas.clone(), digest.clone());
            (digest.to_string(), declared_size, Some(opener))
        }
        NodeKind::Symlink => (link_name.unwrap_or_default(), 0, None),
        _ => (String::new(), 0, None),
    };

    Ok(Some(SourceNode {
        stat: Stat {
            name,
            kind,
            size,
            payload,
            attributes: NodeAttributes {
                mtime: DateTime::from_timestamp(mtime as i64, 0).unwrap_or(DateTime::UNIX_EPOCH),
                user_id: uid.to_string(),
                group_id: gid.to_string(),
                user_name,
                group_name,
                mode: format!("0o{mode:o}"),
                xattrs,
            },
        },
        opener,
    }))
}

/// Collects xattrs from the entry's PAX records, walking the
/// configured prefixes in order so later prefixes win on collision.
async fn extract_xattrs(
    entry: &mut Entry<Archive<ArchiveReader>>,
    config: &TarWalkConfig,
) -> Result<BTreeMap<String, Vec<u8>>, Error> {
    let mut records = Vec::new();
    if let Some(extensions) = entry.pax_extensions().await? {
        for extension in extensions {
            let extension = extension?;
            let Ok(key) = extension.key() else { continue };
            records.push((key.to_string(), extension.value_bytes().to_vec()));
        }
    }

    let mut xattrs = BTreeMap::new();
    for prefix in &config.xattr_pax_prefixes {
        for (key, value) in &records {
            if let Some(attr) = key.strip_prefix(prefix.as_str()) {
                let mut value = value.clone();
                if config.trim_nul_xattrs && value.last() == Some(&0) {
                    value.pop();
                }
                xattrs.insert(attr.to_string(), value);
            }
        }
    }
    Ok(xattrs)
}

fn cas_opener(cas: Arc<TarCas>, digest: SriDigest) -> NodeOpener {
    Box::new(move || {
        let cas = cas.clone();
        let digest = digest.clone();
        Box::pin(async move { cas.open(&digest).await })
    })
}

fn normalize_name(bytes: &[u8]) -> String {
    let name = String::from_utf8_lossy(bytes);
    if name.starts_with('/') {
        name.into_owned()
    } else {
        format!("/{name}")
    }
}

/// Maps a tar typeflag to a node kind. `None` marks entries the
/// iterator consumes for metadata only.
fn kind_from_entry_type(entry_type: EntryType) -> Option<NodeKind> {
    match entry_type {
        EntryType::Directory => Some(NodeKind::Directory),
        // sparse entries present as regular; the section recorder
        // rejects them when the observed bytes disagree.
        EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
            Some(NodeKind::Regular)
        }
        EntryType::Symlink => Some(NodeKind::Symlink),
        EntryType::XHeader | EntryType::XGlobalHeader => None,
        EntryType::GNULongName | EntryType::GNULongLink => None,
        _ => Some(NodeKind::Other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_gain_a_leading_slash() {
        assert_eq!(normalize_name(b"a/b.txt"), "/a/b.txt");
        assert_eq!(normalize_name(b"/already"), "/already");
    }

    #[test]
    fn metadata_entries_carry_no_node() {
        assert_eq!(kind_from_entry_type(EntryType::XHeader), None);
        assert_eq!(kind_from_entry_type(EntryType::XGlobalHeader), None);
        assert_eq!(
            kind_from_entry_type(EntryType::Fifo),
            Some(NodeKind::Other)
        );
    }
}
