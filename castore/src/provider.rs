//! Provider registry: string-keyed factories for sources, sinks and CAS
//! backends, with a uniform string-keyed option surface.
//!
//! Builders declare their options as a static schema; `set` validates
//! keys and value types against it and accumulates offenders, which
//! `build` reports in one [`Error::InvalidOptions`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::blobservice::BlobService;
use crate::source::{Sink, Source};
use crate::Error;

/// A named family of factories. Capabilities a provider does not
/// implement return [`Error::Unsupported`] from the default methods.
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    fn source_builder(&self) -> Result<Box<dyn SourceBuilder>, Error> {
        Err(Error::Unsupported(format!(
            "provider {:?} cannot build sources",
            self.name()
        )))
    }

    fn sink_builder(&self) -> Result<Box<dyn SinkBuilder>, Error> {
        Err(Error::Unsupported(format!(
            "provider {:?} cannot build sinks",
            self.name()
        )))
    }

    fn cas_builder(&self) -> Result<Box<dyn CasBuilder>, Error> {
        Err(Error::Unsupported(format!(
            "provider {:?} cannot build CAS backends",
            self.name()
        )))
    }
}

#[async_trait]
pub trait SourceBuilder: Send {
    /// Sets the provider-specific source reference (a path, usually).
    fn source_ref(&mut self, reference: &str);

    /// Sets a string-keyed option, validated against the declared schema.
    fn set(&mut self, key: &str, value: &str);

    async fn build(self: Box<Self>) -> Result<Box<dyn Source>, Error>;
}

#[async_trait]
pub trait SinkBuilder: Send {
    fn sink_ref(&mut self, reference: &str);

    fn set(&mut self, key: &str, value: &str);

    async fn build(self: Box<Self>) -> Result<Box<dyn Sink>, Error>;
}

#[async_trait]
pub trait CasBuilder: Send {
    fn set(&mut self, key: &str, value: &str);

    async fn build(self: Box<Self>) -> Result<Arc<dyn BlobService>, Error>;
}

/// Value type an option key accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Str,
    Bool,
    /// Comma-separated list of strings.
    List,
}

/// One declared option of a builder.
#[derive(Debug, Clone, Copy)]
pub struct OptionDef {
    pub key: &'static str,
    pub kind: OptionKind,
}

#[derive(Debug, Clone)]
enum OptionValue {
    Str(String),
    Bool(bool),
    List(Vec<String>),
}

/// Schema-checked bag of option values backing a builder's `set`.
pub struct OptionBag {
    schema: &'static [OptionDef],
    values: HashMap<&'static str, OptionValue>,
    invalid: Vec<String>,
}

impl OptionBag {
    pub fn new(schema: &'static [OptionDef]) -> Self {
        Self {
            schema,
            values: HashMap::new(),
            invalid: Vec::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        let Some(def) = self.schema.iter().find(|def| def.key == key) else {
            self.invalid.push(key.to_string());
            return;
        };
        let parsed = match def.kind {
            OptionKind::Str => OptionValue::Str(value.to_string()),
            OptionKind::Bool => match value.to_ascii_lowercase().as_str() {
                "true" | "1" => OptionValue::Bool(true),
                "false" | "0" => OptionValue::Bool(false),
                _ => {
                    self.invalid.push(key.to_string());
                    return;
                }
            },
            OptionKind::List => {
                OptionValue::List(value.split(',').map(str::to_string).collect())
            }
        };
        self.values.insert(def.key, parsed);
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(OptionValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(OptionValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_list(&self, key: &str) -> Option<&[String]> {
        match self.values.get(key) {
            Some(OptionValue::List(l)) => Some(l),
            _ => None,
        }
    }

    /// Records a builder-specific rejection for a key that passed the
    /// schema (e.g. an enum value out of range).
    pub fn reject(&mut self, key: &str) {
        self.invalid.push(key.to_string());
    }

    /// Fails with [`Error::InvalidOptions`] listing every bad key seen.
    pub fn check(&self) -> Result<(), Error> {
        if self.invalid.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidOptions(self.invalid.clone()))
        }
    }
}

/// Name-to-provider lookup.
#[derive(Default)]
pub struct Registry {
    providers: BTreeMap<&'static str, Arc<dyn Provider>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.providers.keys().copied()
    }
}
