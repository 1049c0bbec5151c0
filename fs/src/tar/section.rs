//! Random access into tar entry bodies.
//!
//! While the sequential tar iterator streams entries for digest
//! computation, [`SectionIndexer`] spies on the underlying reader's
//! cursor and memoizes each body's `(offset, length)` in the digest
//! index. Opening a digest later serves a slice of the archive file via
//! positional reads, which never move the iterator's cursor.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, ReadBuf};

use casfs_castore::blobservice::{BlobRead, BlobService};
use casfs_castore::{sri, Algorithm, DigestIndex, Error, Location, SriDigest};

/// An `AsyncRead` over a shared file handle that accounts for its own
/// absolute offset instead of the kernel's seek cursor, so concurrent
/// positional reads cannot disturb it.
pub struct TrackedReader {
    file: Arc<File>,
    position: Arc<AtomicU64>,
}

impl AsyncRead for TrackedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let position = this.position.load(Ordering::Acquire);
        let unfilled = buf.initialize_unfilled();
        match this.file.read_at(unfilled, position) {
            Ok(n) => {
                buf.advance(n);
                this.position
                    .store(position + n as u64, Ordering::Release);
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

/// Digest-keyed `(offset, length)` memo over a random-access archive.
pub struct SectionIndexer {
    file: Arc<File>,
    position: Arc<AtomicU64>,
    index: Arc<DigestIndex>,
}

impl SectionIndexer {
    /// Returns the indexer plus the tracked reader the tar iterator
    /// must consume, both sharing one cursor.
    pub fn new(file: Arc<File>, index: Arc<DigestIndex>) -> (Self, TrackedReader) {
        let position = Arc::new(AtomicU64::new(0));
        let reader = TrackedReader {
            file: file.clone(),
            position: position.clone(),
        };
        (
            Self {
                file,
                position,
                index,
            },
            reader,
        )
    }

    /// Current absolute offset of the sequential reader.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Streams an entry body to compute its digest, and memoizes the
    /// byte range the body occupied in the archive.
    ///
    /// `declared_size` is the size reported by the tar header. If the
    /// bytes observed on the underlying reader differ, something
    /// between us and the file is hiding bytes (a sparse entry, a
    /// decompression layer) and the section cannot be trusted.
    pub async fn record<R>(
        &self,
        entry: R,
        declared_size: u64,
        algo: Algorithm,
    ) -> Result<SriDigest, Error>
    where
        R: AsyncRead + Unpin + Send,
    {
        let offset_before = self.position();
        let digest = sri::hash_reader(algo, entry).await?;
        let offset_after = self.position();

        if offset_after < offset_before {
            return Err(Error::NonRandomAccess(
                "reader moved backwards while draining entry".to_string(),
            ));
        }
        let observed = offset_after - offset_before;
        if observed != declared_size {
            return Err(Error::NonRandomAccess(format!(
                "header size {declared_size} does not match {observed} bytes on the reader"
            )));
        }

        self.index.set(
            digest.clone(),
            Location::Section {
                offset: offset_before,
                length: observed,
            },
        );
        Ok(digest)
    }

    /// Opens a memoized section as an independent reader.
    pub fn open(&self, digest: &SriDigest) -> Result<Box<dyn BlobRead>, Error> {
        match self.index.get(digest) {
            Some(Location::Section { offset, length }) => Ok(Box::new(SectionReader {
                file: self.file.clone(),
                offset,
                length,
                position: 0,
            })),
            _ => Err(Error::NotFound(digest.to_string())),
        }
    }
}

/// A seekable reader over one byte range of the archive file.
///
/// All reads are positional, so concurrently open sections and the
/// sequential tar cursor never interfere.
pub struct SectionReader {
    file: Arc<File>,
    offset: u64,
    length: u64,
    position: u64,
}

impl AsyncRead for SectionReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let remaining = this.length.saturating_sub(this.position);
        if remaining == 0 {
            return Poll::Ready(Ok(()));
        }
        let unfilled = buf.initialize_unfilled();
        let want = unfilled.len().min(remaining as usize);
        match this
            .file
            .read_at(&mut unfilled[..want], this.offset + this.position)
        {
            Ok(n) => {
                buf.advance(n);
                this.position += n as u64;
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncSeek for SectionReader {
    fn start_seek(self: Pin<&mut Self>, seek_from: std::io::SeekFrom) -> std::io::Result<()> {
        let this = self.get_mut();
        let target = match seek_from {
            std::io::SeekFrom::Start(n) => n as i64,
            std::io::SeekFrom::End(n) => this.length as i64 + n,
            std::io::SeekFrom::Current(n) => this.position as i64 + n,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of section",
            ));
        }
        this.position = target as u64;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Poll::Ready(Ok(self.position))
    }
}

impl BlobRead for SectionReader {}

/// Fallback for inputs without random access (pipes, compressed
/// streams): entry bodies are buffered, validated and copied into a
/// regular blob store.
pub struct FallbackIndexer {
    blob_service: Arc<dyn BlobService>,
}

impl FallbackIndexer {
    pub fn new(blob_service: Arc<dyn BlobService>) -> Self {
        Self { blob_service }
    }

    pub async fn record<R>(
        &self,
        mut entry: R,
        declared_size: u64,
        algo: Algorithm,
    ) -> Result<SriDigest, Error>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).await?;
        if buf.len() as u64 != declared_size {
            return Err(Error::NonRandomAccess(format!(
                "header size {declared_size} does not match {} bytes in the entry",
                buf.len()
            )));
        }
        let digest = sri::hash_reader(algo, buf.as_slice()).await?;
        let mut reader: &[u8] = &buf;
        self.blob_service.write(&digest, &mut reader).await?;
        Ok(digest)
    }

    pub async fn open(&self, digest: &SriDigest) -> Result<Box<dyn BlobRead>, Error> {
        self.blob_service
            .open_read(digest)
            .await?
            .ok_or_else(|| Error::NotFound(digest.to_string()))
    }
}

/// The CAS variant backing a tar source, chosen at construction time
/// depending on whether the input supports positional reads.
pub enum TarCas {
    Sections(SectionIndexer),
    Fallback(FallbackIndexer),
}

impl TarCas {
    pub async fn record<R>(
        &self,
        entry: R,
        declared_size: u64,
        algo: Algorithm,
    ) -> Result<SriDigest, Error>
    where
        R: AsyncRead + Unpin + Send,
    {
        match self {
            TarCas::Sections(indexer) => indexer.record(entry, declared_size, algo).await,
            TarCas::Fallback(indexer) => indexer.record(entry, declared_size, algo).await,
        }
    }

    pub async fn open(&self, digest: &SriDigest) -> Result<Box<dyn BlobRead>, Error> {
        match self {
            TarCas::Sections(indexer) => indexer.open(digest),
            TarCas::Fallback(indexer) => indexer.open(digest).await,
        }
    }
}
