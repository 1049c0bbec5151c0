use bytes::Bytes;
use pin_project_lite::pin_project;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tokio::io::AsyncRead;

use crate::sri::{Algorithm, SriDigest};

/// Runtime-selected SRI hasher.
pub(crate) enum SriHasher {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl SriHasher {
    pub(crate) fn new(algo: Algorithm) -> Self {
        match algo {
            Algorithm::Sha256 => SriHasher::Sha256(Sha256::new()),
            Algorithm::Sha384 => SriHasher::Sha384(Sha384::new()),
            Algorithm::Sha512 => SriHasher::Sha512(Sha512::new()),
        }
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        match self {
            SriHasher::Sha256(h) => h.update(data),
            SriHasher::Sha384(h) => h.update(data),
            SriHasher::Sha512(h) => h.update(data),
        }
    }

    pub(crate) fn finalize(self) -> SriDigest {
        let (algo, raw) = match self {
            SriHasher::Sha256(h) => (
                Algorithm::Sha256,
                Bytes::copy_from_slice(h.finalize().as_slice()),
            ),
            SriHasher::Sha384(h) => (
                Algorithm::Sha384,
                Bytes::copy_from_slice(h.finalize().as_slice()),
            ),
            SriHasher::Sha512(h) => (
                Algorithm::Sha512,
                Bytes::copy_from_slice(h.finalize().as_slice()),
            ),
        };
        SriDigest::from_hasher_output(algo, raw)
    }
}

pin_project! {
    /// Wraps an existing AsyncRead and digests all data read "through" it.
    pub struct HashingReader<R>
    where
        R: AsyncRead,
    {
        #[pin]
        inner: R,
        hasher: SriHasher,
    }
}

impl<R> HashingReader<R>
where
    R: AsyncRead,
{
    pub fn new(algo: Algorithm, inner: R) -> Self {
        Self {
            inner,
            hasher: SriHasher::new(algo),
        }
    }

    /// Return the digest of everything read so far.
    pub fn into_digest(self) -> SriDigest {
        self.hasher.finalize()
    }
}

impl<R> AsyncRead for HashingReader<R>
where
    R: AsyncRead,
{
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let filled_before = buf.filled().len();

        let this = self.project();
        let ret = this.inner.poll_read(cx, buf);

        // everything newly filled goes into the hasher.
        this.hasher.update(&buf.filled()[filled_before..]);

        ret
    }
}
