//! Storage backend errors.

/// Errors from a storage backend.
///
/// Any of these reaching the runtime terminates the process: the broker
/// runs under a supervisor and does not retry storage internally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The backend could not be read or written.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// A value could not be encoded or decoded.
    #[error("storage serialization error: {0}")]
    Serialization(String),

    /// Stored state violates an invariant, e.g. a session row pointing at a
    /// missing record row.
    #[error("storage corruption: {0}")]
    Corrupt(String),
}
