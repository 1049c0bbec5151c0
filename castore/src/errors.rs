use thiserror::Error;

/// Errors shared by every casfs subsystem.
///
/// End-of-stream is not part of this taxonomy: sources signal orderly
/// termination by returning `None` from `next()`.
#[derive(Debug, Error)]
pub enum Error {
    /// An SRI string failed to parse.
    #[error("malformed digest: {0}")]
    MalformedDigest(String),

    /// Computed digest differs from the declared one.
    #[error("integrity mismatch: expected {expected}, computed {computed}")]
    IntegrityMismatch { expected: String, computed: String },

    /// The digest is absent from the store or index.
    #[error("not found: {0}")]
    NotFound(String),

    /// A write was attempted on a read-only store.
    #[error("store is read-only")]
    ReadOnly,

    /// The tar indexer could not memoize a section.
    #[error("non random access input: {0}")]
    NonRandomAccess(String),

    /// A builder received unknown or wrong-typed options.
    #[error("invalid options: {}", .0.join(", "))]
    InvalidOptions(Vec<String>),

    /// The provider does not implement the requested capability.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A single-flight runnable was entered twice.
    #[error("already running")]
    AlreadyRunning,

    /// Underlying filesystem or network error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Union of independent failures, e.g. collected across runnables.
    #[error("{}", join_errors(.0))]
    Aggregate(Vec<Error>),
}

impl Error {
    /// Joins a list of errors into none, the error itself, or an aggregate.
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(Error::Aggregate(errors)),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(value: tokio::task::JoinError) -> Self {
        Error::Io(std::io::Error::new(std::io::ErrorKind::Other, value))
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_empty_is_none() {
        assert!(Error::aggregate(vec![]).is_none());
    }

    #[test]
    fn aggregate_single_unwraps() {
        let err = Error::aggregate(vec![Error::ReadOnly]).unwrap();
        assert!(matches!(err, Error::ReadOnly));
    }

    #[test]
    fn aggregate_many_joins_messages() {
        let err = Error::aggregate(vec![Error::ReadOnly, Error::AlreadyRunning]).unwrap();
        assert_eq!(err.to_string(), "store is read-only; already running");
    }
}
