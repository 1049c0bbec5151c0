use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::instrument;

use super::{BlobRead, BlobService};
use crate::provider::{CasBuilder, OptionBag, OptionDef, OptionKind, Provider};
use crate::sri::{self, SriDigest};
use crate::Error;

/// The reference blob store: an in-memory digest-to-bytes map,
/// optionally read-only.
#[derive(Clone, Default)]
pub struct MemoryBlobService {
    db: Arc<RwLock<HashMap<SriDigest, Bytes>>>,
    read_only: bool,
}

impl MemoryBlobService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_read_only() -> Self {
        Self {
            db: Default::default(),
            read_only: true,
        }
    }
}

#[async_trait]
impl BlobService for MemoryBlobService {
    #[instrument(skip(self, digest), fields(blob.digest=%digest))]
    async fn has(&self, digest: &SriDigest) -> Result<bool, Error> {
        let db = self.db.read().unwrap();
        Ok(db.contains_key(digest))
    }

    async fn open_read(&self, digest: &SriDigest) -> Result<Option<Box<dyn BlobRead>>, Error> {
        let db = self.db.read().unwrap();

        match db.get(digest) {
            Some(bytes) => Ok(Some(Box::new(Cursor::new(bytes.clone())))),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, digest, reader), fields(blob.digest=%digest))]
    async fn write(
        &self,
        digest: &SriDigest,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), Error> {
        if self.db.read().unwrap().contains_key(digest) {
            return Ok(());
        }
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        sri::validate(digest, buf.as_slice()).await?;

        // The containment test repeats inside the critical section so
        // concurrent writers of the same digest collapse to the first.
        self.db
            .write()
            .unwrap()
            .entry(digest.clone())
            .or_insert_with(|| Bytes::from(buf));
        Ok(())
    }
}

/// Provider exposing the in-memory store as CAS backend `memory`.
pub struct MemoryProvider;

impl Provider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn cas_builder(&self) -> Result<Box<dyn CasBuilder>, Error> {
        Ok(Box::new(MemoryCasBuilder {
            options: OptionBag::new(MEMORY_CAS_OPTIONS),
        }))
    }
}

const MEMORY_CAS_OPTIONS: &[OptionDef] = &[OptionDef {
    key: "readonly",
    kind: OptionKind::Bool,
}];

struct MemoryCasBuilder {
    options: OptionBag,
}

#[async_trait]
impl CasBuilder for MemoryCasBuilder {
    fn set(&mut self, key: &str, value: &str) {
        self.options.set(key, value);
    }

    async fn build(self: Box<Self>) -> Result<Arc<dyn BlobService>, Error> {
        self.options.check()?;
        let service = if self.options.get_bool("readonly").unwrap_or(false) {
            MemoryBlobService::new_read_only()
        } else {
            MemoryBlobService::new()
        };
        Ok(Arc::new(service))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::Algorithm;

    const BLOB_A: &[u8] = b"hello\n";
    const BLOB_B: &[u8] = &[0xaa; 4096];

    async fn digest_of(data: &[u8]) -> SriDigest {
        sri::hash_reader(Algorithm::Sha256, data).await.unwrap()
    }

    #[tokio::test]
    async fn has_nonexistent_false() {
        let blob_service = MemoryBlobService::new();
        assert!(!blob_service
            .has(&digest_of(BLOB_A).await)
            .await
            .expect("must not fail"));
    }

    #[tokio::test]
    async fn not_found_read() {
        let blob_service = MemoryBlobService::new();
        assert!(blob_service
            .open_read(&digest_of(BLOB_A).await)
            .await
            .expect("must not fail")
            .is_none());
    }

    #[rstest]
    #[case::small(BLOB_A)]
    #[case::big(BLOB_B)]
    #[tokio::test]
    async fn put_has_get(#[case] blob_contents: &[u8]) {
        let blob_service = MemoryBlobService::new();
        let blob_digest = digest_of(blob_contents).await;

        blob_service
            .write(&blob_digest, &mut &blob_contents[..])
            .await
            .expect("write must succeed");

        assert!(blob_service
            .has(&blob_digest)
            .await
            .expect("must not fail"));

        let mut reader = blob_service
            .open_read(&blob_digest)
            .await
            .expect("must not fail")
            .expect("must be some");

        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .expect("read must succeed");
        assert_eq!(blob_contents, &buf[..], "read blob contents must match");
    }

    #[tokio::test]
    async fn write_rejects_integrity_mismatch() {
        let blob_service = MemoryBlobService::new();
        let blob_digest = digest_of(BLOB_A).await;

        let err = blob_service
            .write(&blob_digest, &mut &b"x"[..])
            .await
            .expect_err("write must fail");
        assert!(matches!(err, Error::IntegrityMismatch { .. }));

        // the store must be unchanged.
        assert!(!blob_service.has(&blob_digest).await.unwrap());
    }

    #[tokio::test]
    async fn write_is_idempotent_and_first_wins() {
        let blob_service = MemoryBlobService::new();
        let blob_digest = digest_of(BLOB_A).await;

        blob_service
            .write(&blob_digest, &mut &BLOB_A[..])
            .await
            .unwrap();
        // a second write of the same digest is a no-op, even though the
        // payload would not validate.
        blob_service
            .write(&blob_digest, &mut &b"garbage"[..])
            .await
            .unwrap();

        let mut reader = blob_service
            .open_read(&blob_digest)
            .await
            .unwrap()
            .unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf[..], BLOB_A);
    }

    #[tokio::test]
    async fn read_only_rejects_writes() {
        let blob_service = MemoryBlobService::new_read_only();
        let blob_digest = digest_of(BLOB_A).await;

        let err = blob_service
            .write(&blob_digest, &mut &BLOB_A[..])
            .await
            .expect_err("write must fail");
        assert!(matches!(err, Error::ReadOnly));
    }

    #[tokio::test]
    async fn provider_builds_readonly_store() {
        let mut builder = MemoryProvider.cas_builder().unwrap();
        builder.set("readonly", "true");
        let blob_service = builder.build().await.unwrap();

        let err = blob_service
            .write(&digest_of(BLOB_A).await, &mut &BLOB_A[..])
            .await
            .expect_err("write must fail");
        assert!(matches!(err, Error::ReadOnly));
    }

    #[tokio::test]
    async fn provider_rejects_unknown_options() {
        let mut builder = MemoryProvider.cas_builder().unwrap();
        builder.set("eviction", "lru");
        let err = match builder.build().await {
            Err(e) => e,
            Ok(_) => panic!("build must fail"),
        };
        assert!(matches!(err, Error::InvalidOptions(keys) if keys == vec!["eviction"]));
    }
}
