use std::sync::Arc;

use url::Url;

use super::{BlobService, MemoryBlobService};
use crate::Error;

/// Constructs a [BlobService] from a URI.
///
/// Supported schemes:
/// - `memory://` ([MemoryBlobService], read-write)
/// - `memory+ro://` ([MemoryBlobService], read-only)
pub fn from_addr(uri: &str) -> Result<Arc<dyn BlobService>, Error> {
    let url = Url::parse(uri)
        .map_err(|e| Error::Unsupported(format!("unable to parse url {uri:?}: {e}")))?;

    match url.scheme() {
        scheme @ ("memory" | "memory+ro") => {
            // memory doesn't support host or path in the URL.
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::Unsupported(format!(
                    "memory scheme with host or path: {uri:?}"
                )));
            }
            Ok(if scheme == "memory" {
                Arc::new(MemoryBlobService::new())
            } else {
                Arc::new(MemoryBlobService::new_read_only())
            })
        }
        scheme => Err(Error::Unsupported(format!("unknown scheme: {scheme}"))),
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::from_addr;

    /// This uses an unsupported scheme.
    #[test_case("http://foo.example/test", false; "unsupported scheme")]
    /// This correctly sets the scheme, and doesn't set a path.
    #[test_case("memory://", true; "memory valid")]
    /// Read-only variant.
    #[test_case("memory+ro://", true; "memory readonly valid")]
    /// This sets a memory url host to `foo`.
    #[test_case("memory://foo", false; "memory invalid host")]
    /// This sets a memory url path to "/", which is invalid.
    #[test_case("memory:///", false; "memory invalid root path")]
    fn from_addr_table(uri_str: &str, is_ok: bool) {
        assert_eq!(from_addr(uri_str).is_ok(), is_ok);
    }
}
