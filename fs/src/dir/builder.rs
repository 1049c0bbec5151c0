use std::sync::Arc;

use async_trait::async_trait;

use casfs_castore::provider::{
    OptionBag, OptionDef, OptionKind, Provider, SourceBuilder,
};
use casfs_castore::{Algorithm, DigestIndex, Error, Source};

use super::{DirSource, WalkConfig};

const DIR_SOURCE_OPTIONS: &[OptionDef] = &[
    OptionDef {
        key: "cas-algorithm",
        kind: OptionKind::Str,
    },
    OptionDef {
        key: "keep-prefix",
        kind: OptionKind::Bool,
    },
    OptionDef {
        key: "preserve-xattrs",
        kind: OptionKind::Bool,
    },
];

/// Builds a [`DirSource`].
///
/// `keep-prefix` keeps the configured dir prefix on emitted names; by
/// default the prefix is stripped, so a node at `/foo/bar` under dir
/// `/foo` is emitted as `/bar`.
pub struct DirSourceBuilder {
    dir: Option<String>,
    algorithm: Option<Algorithm>,
    keep_prefix: Option<bool>,
    preserve_xattrs: Option<bool>,
    options: OptionBag,
}

impl Default for DirSourceBuilder {
    fn default() -> Self {
        Self {
            dir: None,
            algorithm: None,
            keep_prefix: None,
            preserve_xattrs: None,
            options: OptionBag::new(DIR_SOURCE_OPTIONS),
        }
    }
}

impl DirSourceBuilder {
    pub fn new(dir: impl Into<String>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    pub fn with_keep_prefix(mut self, keep_prefix: bool) -> Self {
        self.keep_prefix = Some(keep_prefix);
        self
    }

    pub fn with_preserve_xattrs(mut self, preserve_xattrs: bool) -> Self {
        self.preserve_xattrs = Some(preserve_xattrs);
        self
    }

    pub fn build_source(mut self) -> Result<DirSource, Error> {
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

        let Some(mut dir) = self.dir else {
            return Err(Error::InvalidOptions(vec!["source-ref".to_string()]));
        };
        // a trailing slash on the dir normalizes the same as without.
        if dir.len() > 1 && dir.ends_with('/') {
            dir.pop();
        }

        Ok(DirSource::spawn(WalkConfig {
            dir,
            algo: algorithm
                .or(self.algorithm)
                .unwrap_or_default(),
            keep_prefix: self
                .options
                .get_bool("keep-prefix")
                .or(self.keep_prefix)
                .unwrap_or(false),
            preserve_xattrs: self
                .options
                .get_bool("preserve-xattrs")
                .or(self.preserve_xattrs)
                .unwrap_or(false),
            index: Arc::new(DigestIndex::new()),
        }))
    }
}

#[async_trait]
impl SourceBuilder for DirSourceBuilder {
    fn source_ref(&mut self, reference: &str) {
        self.dir = Some(reference.to_string());
    }

    fn set(&mut self, key: &str, value: &str) {
        self.options.set(key, value);
    }

    async fn build(self: Box<Self>) -> Result<Box<dyn Source>, Error> {
        Ok(Box::new(self.build_source()?))
    }
}

/// The `dir` provider: sources over on-disk directory trees.
pub struct DirProvider;

impl Provider for DirProvider {
    fn name(&self) -> &'static str {
        "dir"
    }

    fn source_builder(&self) -> Result<Box<dyn SourceBuilder>, Error> {
        Ok(Box::new(DirSourceBuilder::default()))
    }
}
