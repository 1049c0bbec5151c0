//! Transport-agnostic CAS ingestion from a framed byte stream.
//!
//! A record stream is a sequence of frames, each a digest packet
//! followed by a payload packet. A packet is a u64 little-endian
//! length, the payload itself, and NUL padding to the next 8 byte
//! boundary.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::instrument;

use crate::blobservice::BlobService;
use crate::sri::SriDigest;
use crate::Error;

const LEN_SIZE: usize = 8;

/// 8 null bytes, used to write out padding.
const EMPTY_BYTES: &[u8; 8] = &[0u8; 8];

/// Upper bound for the digest header packet.
const MAX_DIGEST_LEN: u64 = 256;

/// Upper bound for a single recorded payload.
const MAX_PAYLOAD_LEN: u64 = 1 << 32;

const fn padding_len(len: u64) -> u64 {
    (8 - len % 8) % 8
}

/// Reads a length field, or `None` on a clean EOF before its first byte.
async fn try_read_len<R>(reader: &mut R) -> std::io::Result<Option<u64>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; LEN_SIZE];
    let mut filled = 0;
    while filled < LEN_SIZE {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "eof inside packet length",
            ));
        }
        filled += n;
    }
    Ok(Some(u64::from_le_bytes(buf)))
}

async fn read_len<R>(reader: &mut R) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    try_read_len(reader).await?.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof inside record frame")
    })
}

/// Reads a packet body of the given signalled length, validating the
/// padding and the allowed size.
async fn read_packet_body<R>(reader: &mut R, len: u64, allowed: u64) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if len > allowed {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "signalled packet size not in allowed range",
        ));
    }

    let padded_len = len + padding_len(len);
    let mut limited_reader = reader.take(padded_len);

    let mut buf = Vec::new();
    let got = limited_reader.read_to_end(&mut buf).await?;
    if got as u64 != padded_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "got less bytes than expected",
        ));
    }

    let padding = &buf[len as usize..];
    if !padding.iter().all(|b| *b == b'\0') {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "padding is not all zeroes",
        ));
    }

    buf.truncate(len as usize);
    Ok(buf)
}

async fn write_packet<W>(writer: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u64_le(data.len() as u64).await?;
    writer.write_all(data).await?;
    let pad = padding_len(data.len() as u64) as usize;
    if pad != 0 {
        writer.write_all(&EMPTY_BYTES[..pad]).await?;
    }
    Ok(())
}

/// Reads framed blobs from `reader` until EOF, writing each into the
/// blob store.
///
/// A clean EOF at a frame boundary terminates with `Ok`; EOF inside a
/// frame, a malformed digest header, or any store write error
/// terminates the consumer with that error.
#[instrument(skip_all, err)]
pub async fn consume<R>(blob_service: &dyn BlobService, reader: &mut R) -> Result<(), Error>
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        let Some(len) = try_read_len(reader).await? else {
            return Ok(());
        };
        let header = read_packet_body(reader, len, MAX_DIGEST_LEN).await?;
        let header = String::from_utf8(header)
            .map_err(|_| Error::MalformedDigest("digest header is not utf-8".to_string()))?;
        let digest: SriDigest = header.parse()?;

        let len = read_len(reader).await?;
        let payload = read_packet_body(reader, len, MAX_PAYLOAD_LEN).await?;

        let mut payload_reader: &[u8] = &payload;
        blob_service.write(&digest, &mut payload_reader).await?;
        tracing::debug!(blob.digest=%digest, blob.size=payload.len(), "recorded blob");
    }
}

/// Emits record frames onto a byte stream.
pub struct RecordWriter<W> {
    inner: W,
}

impl<W> RecordWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes one `(digest, payload)` frame.
    pub async fn send(&mut self, digest: &SriDigest, payload: &[u8]) -> Result<(), Error> {
        write_packet(&mut self.inner, digest.to_string().as_bytes()).await?;
        write_packet(&mut self.inner, payload).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.inner.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
