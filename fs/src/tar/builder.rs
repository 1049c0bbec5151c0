use std::sync::Arc;

use async_trait::async_trait;

use casfs_castore::blobservice::MemoryBlobService;
use casfs_castore::provider::{
    OptionBag, OptionDef, OptionKind, Provider, SinkBuilder, SourceBuilder,
};
use casfs_castore::{Algorithm, DigestIndex, Error, Sink, Source};

use super::section::{FallbackIndexer, SectionIndexer, TarCas};
use super::sink::{TarFormat, TarSink};
use super::source::{ArchiveReader, TarSource, TarWalkConfig};
use super::ArchiveWriter;

pub(super) const DEFAULT_XATTR_PAX_PREFIX: &str = "SCHILY.xattr.";

const TAR_SOURCE_OPTIONS: &[OptionDef] = &[
    OptionDef {
        key: "cas-algorithm",
        kind: OptionKind::Str,
    },
    OptionDef {
        key: "xattr-prefixes",
        kind: OptionKind::List,
    },
    OptionDef {
        key: "trim-nul-xattrs",
        kind: OptionKind::Bool,
    },
];

/// Builds a [`TarSource`].
///
/// Sources built from a path get the section indexer: entry bodies are
/// memoized as byte ranges of the archive file. Sources built from an
/// arbitrary reader fall back to buffering bodies into an in-memory
/// blob store.
pub struct TarSourceBuilder {
    path: Option<String>,
    reader: Option<ArchiveReader>,
    algorithm: Option<Algorithm>,
    xattr_pax_prefixes: Option<Vec<String>>,
    trim_nul_xattrs: Option<bool>,
    options: OptionBag,
}

impl Default for TarSourceBuilder {
    fn default() -> Self {
        Self {
            path: None,
            reader: None,
            algorithm: None,
            xattr_pax_prefixes: None,
            trim_nul_xattrs: None,
            options: OptionBag::new(TAR_SOURCE_OPTIONS),
        }
    }
}

impl TarSourceBuilder {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Uses an already-open byte stream instead of a path. Such
    /// sources cannot be section-indexed.
    pub fn with_reader(mut self, reader: ArchiveReader) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    /// Prefixes identifying xattrs in PAX records; later prefixes
    /// override earlier ones. An empty list disables xattr extraction.
    pub fn with_xattr_pax_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.xattr_pax_prefixes = Some(prefixes);
        self
    }

    pub fn with_trim_nul_xattrs(mut self, trim: bool) -> Self {
        self.trim_nul_xattrs = Some(trim);
        self
    }

    pub async fn build_source(mut self) -> Result<TarSource, Error> {
        let algorithm = match self.options.get_str("cas-algorithm") {
            Some(s) => match s.parse::<Algorithm>() {
                Ok(algorithm) => Some(algorithm),
                Err(_) => {
                    self.options.reject("cas-algorithm");
                    None
                }
            },
            None => None,
        };
        self.options.check()?;

        let config = TarWalkConfig {
            algo: algorithm.or(self.algorithm).unwrap_or_default(),
            xattr_pax_prefixes: self
                .options
                .get_list("xattr-prefixes")
                .map(<[String]>::to_vec)
                .or(self.xattr_pax_prefixes)
                .unwrap_or_else(|| vec![DEFAULT_XATTR_PAX_PREFIX.to_string()]),
            trim_nul_xattrs: self
                .options
                .get_bool("trim-nul-xattrs")
                .or(self.trim_nul_xattrs)
                .unwrap_or(false),
        };

        let (reader, cas): (ArchiveReader, TarCas) = match (self.path, self.reader) {
            (Some(path), None) => {
                let file = Arc::new(std::fs::File::open(&path)?);
                let (indexer, tracked) =
                    SectionIndexer::new(file, Arc::new(DigestIndex::new()));
                (Box::new(tracked), TarCas::Sections(indexer))
            }
            (None, Some(reader)) => {
                let fallback = FallbackIndexer::new(Arc::new(MemoryBlobService::new()));
                (reader, TarCas::Fallback(fallback))
            }
            _ => {
                // exactly one of path or reader must be given.
                return Err(Error::InvalidOptions(vec!["source-ref".to_string()]));
            }
        };

        Ok(TarSource::spawn(reader, Arc::new(cas), config))
    }
}

#[async_trait]
impl SourceBuilder for TarSourceBuilder {
    fn source_ref(&mut self, reference: &str) {
        self.path = Some(reference.to_string());
    }

    fn set(&mut self, key: &str, value: &str) {
        self.options.set(key, value);
    }

    async fn build(self: Box<Self>) -> Result<Box<dyn Source>, Error> {
        Ok(Box::new(self.build_source().await?))
    }
}

const TAR_SINK_OPTIONS: &[OptionDef] = &[
    OptionDef {
        key: "tar-format",
        kind: OptionKind::Str,
    },
    OptionDef {
        key: "root",
        kind: OptionKind::Str,
    },
    OptionDef {
        key: "xattr-prefix",
        kind: OptionKind::Str,
    },
];

/// Builds a [`TarSink`]. PAX format by default; `root` prepends a
/// directory to every name (empty skips the root record).
pub struct TarSinkBuilder {
    path: Option<String>,
    writer: Option<ArchiveWriter>,
    format: Option<TarFormat>,
    root: Option<String>,
    xattr_pax_prefix: Option<String>,
    options: OptionBag,
}

impl Default for TarSinkBuilder {
    fn default() -> Self {
        Self {
            path: None,
            writer: None,
            format: None,
            root: None,
            xattr_pax_prefix: None,
            options: OptionBag::new(TAR_SINK_OPTIONS),
        }
    }
}

impl TarSinkBuilder {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_writer(mut self, writer: ArchiveWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_format(mut self, format: TarFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_xattr_pax_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.xattr_pax_prefix = Some(prefix.into());
        self
    }

    pub async fn build_sink(mut self) -> Result<TarSink, Error> {
        let format = match self.options.get_str("tar-format") {
            Some(s) => match s.parse::<TarFormat>() {
                Ok(format) => Some(format),
                Err(()) => {
                    self.options.reject("tar-format");
                    None
                }
            },
            None => None,
        };
        self.options.check()?;

        let writer: ArchiveWriter = match (self.path, self.writer) {
            (Some(path), None) => Box::new(tokio::fs::File::create(&path).await?),
            (None, Some(writer)) => writer,
            _ => {
                return Err(Error::InvalidOptions(vec!["sink-ref".to_string()]));
            }
        };

        Ok(TarSink::new(
            writer,
            format.or(self.format).unwrap_or_default(),
            self.options
                .get_str("root")
                .map(str::to_string)
                .or(self.root)
                .unwrap_or_default(),
            self.options
                .get_str("xattr-prefix")
                .map(str::to_string)
                .or(self.xattr_pax_prefix)
                .unwrap_or_else(|| DEFAULT_XATTR_PAX_PREFIX.to_string()),
        ))
    }
}

#[async_trait]
impl SinkBuilder for TarSinkBuilder {
    fn sink_ref(&mut self, reference: &str) {
        self.path = Some(reference.to_string());
    }

    fn set(&mut self, key: &str, value: &str) {
        self.options.set(key, value);
    }

    async fn build(self: Box<Self>) -> Result<Box<dyn Sink>, Error> {
        Ok(Box::new(self.build_sink().await?))
    }
}

/// The `tar` provider: archive sources and sinks.
pub struct TarProvider;

impl Provider for TarProvider {
    fn name(&self) -> &'static str {
        "tar"
    }

    fn source_builder(&self) -> Result<Box<dyn SourceBuilder>, Error> {
        Ok(Box::new(TarSourceBuilder::default()))
    }

    fn sink_builder(&self) -> Result<Box<dyn SinkBuilder>, Error> {
        Ok(Box::new(TarSinkBuilder::default()))
    }
}
