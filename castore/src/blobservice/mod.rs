use std::io::Cursor;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek};

use crate::sri::SriDigest;
use crate::Error;

mod from_addr;
mod memory;

pub use self::from_addr::from_addr;
pub use self::memory::{MemoryBlobService, MemoryProvider};

/// The base trait all blob stores implement: a digest-to-bytes mapping
/// with write-once semantics and integrity-validated writes.
#[async_trait]
pub trait BlobService: Send + Sync {
    /// Check if the store has the blob, by its content digest.
    async fn has(&self, digest: &SriDigest) -> Result<bool, Error>;

    /// Request a blob from the store. `None` if absent.
    async fn open_read(&self, digest: &SriDigest) -> Result<Option<Box<dyn BlobRead>>, Error>;

    /// Stores the reader's bytes under `digest`.
    ///
    /// Idempotent for already-present digests. Fails with
    /// [`Error::ReadOnly`] on read-only stores and
    /// [`Error::IntegrityMismatch`] when the payload does not hash to
    /// `digest`; nothing is stored in either case.
    async fn write(
        &self,
        digest: &SriDigest,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), Error>;
}

/// A blob stream that can be read and independently seeked.
pub trait BlobRead: AsyncRead + AsyncSeek + Send + Unpin + 'static {}

impl BlobRead for Cursor<Vec<u8>> {}
impl BlobRead for Cursor<bytes::Bytes> {}
impl BlobRead for tokio::fs::File {}
