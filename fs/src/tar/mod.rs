//! Tar archive source, sink, and the section-indexed CAS backing them.

mod builder;
mod section;
mod sink;
mod source;

pub use builder::{TarProvider, TarSinkBuilder, TarSourceBuilder};
pub use section::{FallbackIndexer, SectionIndexer, SectionReader, TarCas, TrackedReader};
pub use sink::{ArchiveWriter, TarFormat, TarSink};
pub use source::{ArchiveReader, TarSource};
